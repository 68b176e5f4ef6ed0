//! S3 object store backend.
//!
//! Reads are chunked ranged GETs; writes are multipart uploads. Listing is a
//! prefix scan filtered through the requested glob, since S3 has no native
//! glob support.

use std::pin::Pin;

use anyhow::{anyhow, Context, Error, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use futures::Stream;
use globset::GlobBuilder;
use tokio_util::io::StreamReader;
use tracing::error;
use url::Url;

use super::{FileInfo, FileSystem, ObjectWriter, Reader};

/// Ranged GET chunk size for readers.
const READ_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Buffered bytes before a multipart part is shipped.
const UPLOAD_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug)]
struct ObjectLocation {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectLocation {
    /// The `scheme://bucket/` prefix object keys are appended to when
    /// reporting full paths.
    fn object_prefix(&self) -> String {
        format!("{}://{}/", self.scheme, self.bucket)
    }
}

/// Splits an `s3://bucket/key` style location into its parts. Accepts the
/// `s3`, `s3a` and `s3n` schemes.
fn parse_s3_uri(uri: &str) -> Result<ObjectLocation, Error> {
    let parsed = Url::parse(uri).with_context(|| format!("could not parse location {uri}"))?;

    if !matches!(parsed.scheme(), "s3" | "s3a" | "s3n") {
        return Err(anyhow!("invalid s3 scheme in location {uri}"));
    }

    let bucket = parsed
        .host_str()
        .ok_or_else(|| anyhow!("location {uri} has no bucket"))?;

    let key = parsed.path().trim_start_matches('/');

    Ok(ObjectLocation {
        scheme: parsed.scheme().to_string(),
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

/// The longest glob-free prefix of `key`, used as the server-side listing
/// prefix before glob filtering happens client-side.
fn glob_prefix(key: &str) -> &str {
    match key.find(['*', '?', '[']) {
        Some(index) => &key[..index],
        None => key,
    }
}

/// Backend over an S3-compatible object store.
pub struct S3FileSystem {
    client: s3::Client,
}

impl S3FileSystem {
    /// Prepares a client from the ambient credential chain.
    pub async fn init() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self {
            client: s3::Client::new(&config),
        })
    }
}

#[async_trait]
impl FileSystem for S3FileSystem {
    async fn list_files(&self, path_glob: &str) -> Result<Vec<FileInfo>> {
        let location = parse_s3_uri(path_glob)?;

        // Match the glob itself, and the glob as a directory, so that a
        // directory-style location transparently lists the files under it.
        let dir_glob = if path_glob.ends_with('/') {
            format!("{path_glob}*")
        } else {
            format!("{path_glob}/*")
        };
        // `*` must stop at `/`, the way the local backend's listing does;
        // otherwise a directory-style location would recurse into nested
        // keys on this backend only.
        let path_matcher = GlobBuilder::new(path_glob)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        let dir_matcher = GlobBuilder::new(&dir_glob)
            .literal_separator(true)
            .build()?
            .compile_matcher();

        let object_prefix = location.object_prefix();
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(&location.bucket)
            .prefix(glob_prefix(&location.key))
            .into_paginator()
            .send();

        let mut files = Vec::new();
        while let Some(result) = response.next().await {
            let page = result.context("listing objects")?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let full_path = format!("{object_prefix}{key}");

                if !path_matcher.is_match(&full_path) && !dir_matcher.is_match(&full_path) {
                    continue;
                }

                files.push(FileInfo {
                    name: full_path,
                    size: object.size().unwrap_or_default() as u64,
                });
            }
        }

        Ok(files)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let location = parse_s3_uri(path)?;

        let head = self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .with_context(|| format!("no file found at {path}"))?;

        Ok(FileInfo {
            name: path.to_string(),
            size: head.content_length().unwrap_or_default() as u64,
        })
    }

    async fn open_reader(&self, path: &str, start_at: u64) -> Result<Reader> {
        let location = parse_s3_uri(path)?;
        let total_size = self.stat(path).await?.size;

        let stream = chunk_stream(self.client.clone(), location, start_at, total_size);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn open_writer(&self, path: &str) -> Result<Box<dyn ObjectWriter>> {
        let location = parse_s3_uri(path)?;

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .with_context(|| format!("starting upload to {path}"))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| anyhow!("upload to {path} has no upload id"))?
            .to_string();

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: location.bucket,
            key: location.key,
            upload_id,
            buf: Vec::new(),
            completed_parts: Vec::new(),
        }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = parse_s3_uri(path)?;
        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await?;
        Ok(())
    }

    fn join(&self, elems: &[&str]) -> String {
        let stripped: Vec<&str> = elems
            .iter()
            .enumerate()
            .map(|(i, elem)| {
                let mut elem = *elem;
                if i != 0 {
                    elem = elem.strip_prefix('/').unwrap_or(elem);
                }
                if i != elems.len() - 1 {
                    elem = elem.strip_suffix('/').unwrap_or(elem);
                }
                elem
            })
            .collect();
        stripped.join("/")
    }
}

/// A stream of ranged GET chunks advancing through the object until
/// `total_size` bytes have been consumed.
fn chunk_stream(
    client: s3::Client,
    location: ObjectLocation,
    start_at: u64,
    total_size: u64,
) -> Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>> {
    Box::pin(futures::stream::try_unfold(
        (client, location, start_at),
        move |(client, location, offset)| async move {
            if offset >= total_size {
                return Ok(None);
            }

            let end = (offset + READ_CHUNK_SIZE).min(total_size) - 1;
            let object = client
                .get_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .range(format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(std::io::Error::other)?;
            let chunk = object
                .body
                .collect()
                .await
                .map_err(std::io::Error::other)?
                .into_bytes();

            Ok(Some((chunk, (client, location, end + 1))))
        },
    ))
}

struct S3Writer {
    client: s3::Client,
    bucket: String,
    key: String,
    upload_id: String,
    buf: Vec<u8>,
    completed_parts: Vec<CompletedPart>,
}

impl S3Writer {
    async fn upload_part(&mut self) -> Result<()> {
        let part_number = self.completed_parts.len() as i32 + 1;
        let body = Bytes::from(std::mem::take(&mut self.buf));

        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await?;

        self.completed_parts.push(
            CompletedPart::builder()
                .e_tag(uploaded.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() > UPLOAD_PART_SIZE {
            self.upload_part().await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        // The final part may be arbitrarily small, but there must be at
        // least one for the completion call to succeed.
        if !self.buf.is_empty() || self.completed_parts.is_empty() {
            self.upload_part().await?;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(self.completed_parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| {
                error!("failed completing upload of {}: {err}", self.key);
                err
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let location = parse_s3_uri("s3://corpus/data/input.txt").unwrap();
        assert_eq!(location.bucket, "corpus");
        assert_eq!(location.key, "data/input.txt");
        assert_eq!(location.scheme, "s3");

        let bare = parse_s3_uri("s3a://corpus").unwrap();
        assert_eq!(bare.bucket, "corpus");
        assert_eq!(bare.key, "");
    }

    #[test]
    fn rejects_non_s3_schemes() {
        assert!(parse_s3_uri("http://corpus/data").is_err());
        assert!(parse_s3_uri("not a url at all").is_err());
    }

    #[test]
    fn listing_prefix_stops_at_the_first_metacharacter() {
        assert_eq!(glob_prefix("data/output-*"), "data/output-");
        assert_eq!(glob_prefix("data/part-?"), "data/part-");
        assert_eq!(glob_prefix("data/[ab]/x"), "data/");
        assert_eq!(glob_prefix("data/plain"), "data/plain");
    }

    #[test]
    fn join_strips_inner_slashes() {
        let fs = S3FileSystem {
            client: s3::Client::from_conf(
                s3::config::Builder::new().behavior_version_latest().build(),
            ),
        };

        assert_eq!(
            fs.join(&["s3://bucket/work/", "/job0", "output-*"]),
            "s3://bucket/work/job0/output-*"
        );
        assert_eq!(fs.join(&["s3://bucket", "out"]), "s3://bucket/out");
    }
}
