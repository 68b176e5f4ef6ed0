//! Emitters connect user code to the object store.
//!
//! The mapper side hash-partitions emitted pairs into one shard file per
//! intermediate bin; the reducer side serializes concurrent emits into a
//! single tab-separated output file.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::fs::{FileSystem, ObjectWriter};
use crate::{hash_partition, Emitter, KeyValue, PartitionFn};

/// Emitter used by map tasks. Keys are partitioned into one of `num_bins`
/// shuffle bins; each bin is a separate shard file, lazily opened at the
/// first emit that lands in it.
pub struct MapperEmitter {
    num_bins: u64,
    mapper_id: u64,
    fs: Arc<dyn FileSystem>,
    out_dir: String,
    writers: Mutex<HashMap<u64, Box<dyn ObjectWriter>>>,
    bytes_written: AtomicU64,
    partition: PartitionFn,
}

impl MapperEmitter {
    pub(crate) fn new(
        num_bins: u64,
        mapper_id: u64,
        fs: Arc<dyn FileSystem>,
        out_dir: impl Into<String>,
    ) -> Self {
        Self {
            num_bins,
            mapper_id,
            fs,
            out_dir: out_dir.into(),
            writers: Mutex::new(HashMap::new()),
            bytes_written: AtomicU64::new(0),
            partition: hash_partition,
        }
    }

    /// Replaces the default partition function. The replacement must return
    /// values in `[0, num_bins)`.
    #[allow(dead_code)]
    pub(crate) fn with_partition(mut self, partition: PartitionFn) -> Self {
        self.partition = partition;
        self
    }

    fn shard_name(&self, bin: u64) -> String {
        let name = format!("map-bin{bin}-{}.out", self.mapper_id);
        self.fs.join(&[&self.out_dir, &name])
    }

    /// Payload bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Closes every open shard writer. A single writer failure does not
    /// short-circuit the others; all errors are reported together.
    pub(crate) async fn close(self) -> Result<()> {
        let writers = self.writers.into_inner();

        let mut failures = Vec::new();
        for (bin, writer) in writers {
            if let Err(err) = writer.close().await {
                failures.push(format!("bin {bin}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("closing shard writers: {}", failures.join("; ")))
        }
    }
}

#[async_trait]
impl Emitter for MapperEmitter {
    async fn emit(&self, key: &str, value: &str) -> Result<()> {
        let bin = (self.partition)(key, self.num_bins);

        let mut writers = self.writers.lock().await;
        let writer = match writers.entry(bin) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let writer = self.fs.open_writer(&self.shard_name(bin)).await?;
                entry.insert(writer)
            }
        };

        let mut record = serde_json::to_vec(&KeyValue::new(key, value))?;
        record.push(b'\n');
        writer.write(&record).await?;

        self.bytes_written
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Emitter used by reduce tasks. Wraps the single output file of a reduce
/// bin; a mutex serializes concurrent emits from per-key reducer tasks, so
/// records always land whole.
pub struct ReducerEmitter {
    writer: Mutex<Option<Box<dyn ObjectWriter>>>,
    bytes_written: AtomicU64,
}

impl ReducerEmitter {
    pub(crate) fn new(writer: Box<dyn ObjectWriter>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Closes the underlying writer. Must not be called more than once.
    pub(crate) async fn close(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("reducer emitter closed twice"))?;
        writer.close().await
    }
}

#[async_trait]
impl Emitter for ReducerEmitter {
    async fn emit(&self, key: &str, value: &str) -> Result<()> {
        let record = format!("{key}\t{value}\n");

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| anyhow!("emit after close"))?;
        writer.write(record.as_bytes()).await?;

        self.bytes_written
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        Ok(())
    }
}
