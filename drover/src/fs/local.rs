//! Local POSIX filesystem backend.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{FileInfo, FileSystem, ObjectWriter, Reader};

/// Backend over the local filesystem. Stateless; paths are used as given.
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn list_files(&self, path_glob: &str) -> Result<Vec<FileInfo>> {
        // A bare directory path transparently lists the files inside it.
        let pattern = match tokio::fs::metadata(path_glob).await {
            Ok(meta) if meta.is_dir() => Path::new(path_glob)
                .join("*")
                .to_string_lossy()
                .into_owned(),
            _ => path_glob.to_string(),
        };

        let mut files = Vec::new();
        for entry in glob::glob(&pattern).context("invalid glob pattern")? {
            let path = entry?;
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_file() {
                files.push(FileInfo {
                    name: path.to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }

        Ok(files)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {path}"))?;
        Ok(FileInfo {
            name: path.to_string(),
            size: meta.len(),
        })
    }

    async fn open_reader(&self, path: &str, start_at: u64) -> Result<Reader> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("open {path}"))?;
        file.seek(SeekFrom::Start(start_at)).await?;
        Ok(Box::new(file))
    }

    async fn open_writer(&self, path: &str) -> Result<Box<dyn ObjectWriter>> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(path)
            .await
            .with_context(|| format!("create {path}"))?;
        Ok(Box::new(LocalWriter { file }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn join(&self, elems: &[&str]) -> String {
        let mut path = PathBuf::new();
        for elem in elems {
            path.push(elem);
        }
        path.to_string_lossy().into_owned()
    }
}

struct LocalWriter {
    file: File,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.shutdown().await?;
        Ok(())
    }
}
