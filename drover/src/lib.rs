//! A serverless MapReduce framework.
//!
//! Users supply a map task and a reduce task, and a [`Driver`] takes care of
//! splitting the input, scheduling map and reduce tasks, and shuffling
//! intermediate data through a shared object store. Tasks run either in-process
//! on the local machine or as short-lived AWS Lambda invocations, with the same
//! task body in both cases. Multi-stage pipelines chain one job's outputs into
//! the next job's inputs.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod config;
mod driver;
mod emitter;
mod executor;
pub mod fs;
mod handler;
mod job;
mod lambda;
mod split;
mod task;

pub use driver::Driver;
pub use emitter::{MapperEmitter, ReducerEmitter};
pub use split::InputSplit;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map task. Any value supplying [`Mapper::map`] can be the map side of a
/// job; the same value may also implement [`Reducer`].
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Consume one input record and emit any number of intermediate pairs.
    async fn map(&self, key: &str, value: &str, emitter: &dyn Emitter) -> Result<()>;
}

/// A reduce task. Receives every value emitted for `key`, in some order.
#[async_trait]
pub trait Reducer: Send + Sync {
    /// Fold all values for `key` into any number of output pairs.
    async fn reduce(&self, key: &str, values: ValueIterator, emitter: &dyn Emitter) -> Result<()>;
}

/// The sink that map and reduce tasks write key-value pairs to.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, key: &str, value: &str) -> Result<()>;
}

/// A lazy, finite, single-pass sequence of values for one key.
///
/// Values arrive through a channel fed by the framework; the iterator is not
/// restartable. Iteration ends when the framework has delivered every value
/// read for the key.
pub struct ValueIterator {
    values: mpsc::Receiver<String>,
}

impl ValueIterator {
    pub(crate) fn new(values: mpsc::Receiver<String>) -> Self {
        Self { values }
    }

    /// The next value for this key, or `None` once all values are consumed.
    pub async fn next(&mut self) -> Option<String> {
        self.values.recv().await
    }
}

/// A job is a mapper/reducer pair. Input locations, sizing, and the executor
/// are configured on the [`Driver`] that runs the job.
pub struct Job {
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) reducer: Arc<dyn Reducer>,
}

impl Job {
    pub fn new<M, R>(mapper: M, reducer: R) -> Self
    where
        M: Mapper + 'static,
        R: Reducer + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
            reducer: Arc::new(reducer),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair. Both halves are opaque strings; the intermediate
/// shuffle form is one JSON object per line.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,

    /// The value.
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Partitioning
/////////////////////////////////////////////////////////////////////////////

/// Segments map keys into intermediate bins. The returned index must be in
/// `[0, num_bins)` and deterministic across processes, since mappers and
/// reducers agree on shard names through it.
pub type PartitionFn = fn(key: &str, num_bins: u64) -> u64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// The default partition function: a 64-bit FNV-1 hash of the key, modulo the
/// bin count. FNV-1 multiplies before folding each byte in, which is what the
/// shard layout on disk is keyed by; the `fnv` crate only provides the 1a
/// variant, so the fold is written out here.
pub fn hash_partition(key: &str, num_bins: u64) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u64::from(*byte);
    }
    hash % num_bins
}
