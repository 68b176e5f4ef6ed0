//! The file backend for MapReduce jobs.
//!
//! Input data is read from a file system; intermediate and output data is
//! written back to one. The interface is abstracted so that jobs run the same
//! against a local directory or an S3-compatible object store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

mod local;
mod s3;

pub use local::LocalFileSystem;
pub use s3::S3FileSystem;

/// Information about a single stored file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path of the file, in the backend's own addressing
    /// (`s3://bucket/key` for S3, a plain path locally).
    pub name: String,

    /// File size in bytes.
    pub size: u64,
}

/// A readable byte stream positioned somewhere inside a stored file.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// A sink for one stored file. Nothing is guaranteed visible to readers until
/// [`ObjectWriter::close`] returns.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes and finalizes the file. Must be called exactly once.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Uniform access to the storage a job reads inputs from and writes
/// intermediate and output data to. Implementations are safe for concurrent
/// use by every task of a run.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Expands a glob-style pattern (`*`, `?`, bracket classes) into the
    /// matching files. A directory path lists the files under it.
    async fn list_files(&self, path_glob: &str) -> Result<Vec<FileInfo>>;

    /// Metadata for an exact path. Fails if no such file exists.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Opens `path` for reading, positioned at byte `start_at`.
    async fn open_reader(&self, path: &str, start_at: u64) -> Result<Reader>;

    /// Opens `path` for writing, truncating anything already there.
    async fn open_writer(&self, path: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Removes `path`. Deleting a missing file is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Joins path elements in the backend's native syntax.
    fn join(&self, elems: &[&str]) -> String;
}

/// Identifies a [`FileSystem`] implementation inside a serialized task, so a
/// remote worker can reconstruct the right backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemKind {
    Local,
    S3,
}

const S3_SCHEMES: [&str; 3] = ["s3://", "s3a://", "s3n://"];

/// The backend kind a location resolves to: `s3://`, `s3a://` and `s3n://`
/// prefixes select the object store, everything else is local.
pub fn location_kind(location: &str) -> FileSystemKind {
    if S3_SCHEMES.iter().any(|scheme| location.starts_with(scheme)) {
        FileSystemKind::S3
    } else {
        FileSystemKind::Local
    }
}

/// Initializes a filesystem of the given kind, preparing credentials and
/// session state as needed.
pub async fn init_filesystem(kind: FileSystemKind) -> Result<Arc<dyn FileSystem>> {
    match kind {
        FileSystemKind::Local => Ok(Arc::new(LocalFileSystem)),
        FileSystemKind::S3 => Ok(Arc::new(S3FileSystem::init().await?)),
    }
}

/// Initializes a filesystem by inferring its kind from a file location.
pub async fn infer_filesystem(location: &str) -> Result<Arc<dyn FileSystem>> {
    init_filesystem(location_kind(location)).await
}
