//! Task bodies for the two phases of a job.
//!
//! A map task scans its byte-range splits into records, runs the user mapper,
//! and hash-partitions the emitted pairs into shard files. A reduce task
//! gathers the shards of its bin, groups records by key, and streams each
//! group through the user reducer into the bin's output file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::emitter::{MapperEmitter, ReducerEmitter};
use crate::fs::FileSystem;
use crate::split::InputSplit;
use crate::task::TaskResult;
use crate::{Job, KeyValue, Mapper, Reducer, ValueIterator};

/// Cap on concurrent per-key reducer calls within one reduce task.
const MAX_CONCURRENT_REDUCERS: usize = 10;

/// A job bound to the storage and layout of one run. Shared read-mostly by
/// the concurrent tasks of the job; only the byte counters mutate, and those
/// atomically.
pub(crate) struct JobContext {
    pub mapper: Arc<dyn Mapper>,
    pub reducer: Arc<dyn Reducer>,
    pub fs: Arc<dyn FileSystem>,
    pub output_path: String,

    /// Number of intermediate bins, fixed before the map phase starts.
    pub intermediate_bins: u64,

    /// Whether to delete a bin's shards after its reduce task succeeds.
    pub cleanup: bool,

    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl JobContext {
    pub fn bind(
        job: &Job,
        fs: Arc<dyn FileSystem>,
        output_path: impl Into<String>,
        intermediate_bins: u64,
        cleanup: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            mapper: job.mapper.clone(),
            reducer: job.reducer.clone(),
            fs,
            output_path: output_path.into(),
            intermediate_bins,
            cleanup,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn result(&self) -> TaskResult {
        TaskResult {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Splits a record into its key and value on the first tab. A record with
/// anything other than exactly two fields is all value.
fn split_record(record: &str) -> (&str, &str) {
    let fields: Vec<&str> = record.split('\t').collect();
    if fields.len() == 2 {
        (fields[0], fields[1])
    } else {
        ("", record)
    }
}

/// Runs one map task over `splits`, writing intermediate shards named after
/// `bin_id` as the mapper identifier.
pub(crate) async fn run_map(ctx: &JobContext, bin_id: u64, splits: &[InputSplit]) -> Result<()> {
    let emitter = MapperEmitter::new(
        ctx.intermediate_bins,
        bin_id,
        ctx.fs.clone(),
        &ctx.output_path,
    );

    let mut failures = Vec::new();
    for split in splits {
        if let Err(err) = process_map_split(ctx, split, &emitter).await {
            failures.push(format!("{}: {err}", split.filename));
            break;
        }
    }

    ctx.bytes_written
        .fetch_add(emitter.bytes_written(), Ordering::Relaxed);
    if let Err(err) = emitter.close().await {
        failures.push(err.to_string());
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("map task {bin_id}: {}", failures.join("; ")))
    }
}

/// Scans one split into newline-terminated records and feeds them to the
/// mapper. A split owns every record that starts inside its byte range: the
/// first (possibly partial) record of a non-initial split belongs to the
/// previous split and is discarded, and scanning runs one record past the
/// range end.
async fn process_map_split(
    ctx: &JobContext,
    split: &InputSplit,
    emitter: &MapperEmitter,
) -> Result<()> {
    let reader = ctx.fs.open_reader(&split.filename, split.start_offset).await?;
    let mut reader = BufReader::new(reader);

    let mut consumed: u64 = 0;
    let mut first = true;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        consumed += n as u64;

        let skip = first && split.start_offset != 0;
        first = false;
        if !skip {
            let record = trim_line_ending(&buf);
            let record = String::from_utf8_lossy(record);
            let (key, value) = split_record(&record);
            ctx.mapper.map(key, value, emitter).await?;
        }

        if consumed > split.size() {
            break;
        }
    }

    ctx.bytes_read.fetch_add(consumed, Ordering::Relaxed);
    Ok(())
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Runs one reduce task: gathers this bin's shards, groups records by key,
/// and runs the reducer over each group, at most [`MAX_CONCURRENT_REDUCERS`]
/// keys at a time.
pub(crate) async fn run_reduce(ctx: &JobContext, bin_id: u64) -> Result<()> {
    let pattern = ctx
        .fs
        .join(&[&ctx.output_path, &format!("map-bin{bin_id}-*")]);
    let shards = ctx
        .fs
        .list_files(&pattern)
        .await
        .with_context(|| format!("listing shards for reduce bin {bin_id}"))?;

    let out_path = ctx
        .fs
        .join(&[&ctx.output_path, &format!("output-part-{bin_id}")]);
    let emitter = Arc::new(ReducerEmitter::new(ctx.fs.open_writer(&out_path).await?));

    // Group in memory: a reducer must see every value of its key, and the
    // over-provisioned bin count bounds how much one bin can hold.
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for shard in &shards {
        debug!("reducing intermediate file {}", shard.name);
        let reader = ctx.fs.open_reader(&shard.name, 0).await?;
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            let kv: KeyValue = serde_json::from_str(&line)
                .with_context(|| format!("bad record in {}", shard.name))?;
            groups.entry(kv.key).or_default().push(kv.value);
        }
        ctx.bytes_read.fetch_add(shard.size, Ordering::Relaxed);
    }

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_REDUCERS));
    let mut handles = Vec::new();
    for (key, values) in groups {
        let permit = semaphore.clone().acquire_owned().await?;
        let (tx, rx) = mpsc::channel(16);
        let iterator = ValueIterator::new(rx);
        let reducer = ctx.reducer.clone();
        let task_emitter = emitter.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            reducer.reduce(&key, iterator, task_emitter.as_ref()).await
        }));

        for value in values {
            if tx.send(value).await.is_err() {
                // The reducer returned without draining; drop the rest.
                break;
            }
        }
    }

    let mut failures = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failures.push(err.to_string()),
            Err(err) => failures.push(format!("reducer task panicked: {err}")),
        }
    }

    ctx.bytes_written
        .fetch_add(emitter.bytes_written(), Ordering::Relaxed);
    if let Err(err) = emitter.close().await {
        failures.push(err.to_string());
    }

    if !failures.is_empty() {
        return Err(anyhow!("reduce task {bin_id}: {}", failures.join("; ")));
    }

    if ctx.cleanup {
        for shard in &shards {
            if let Err(err) = ctx.fs.delete(&shard.name).await {
                warn!("failed deleting shard {}: {err}", shard.name);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::Emitter;

    struct RecordingMapper {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mapper for RecordingMapper {
        async fn map(&self, _key: &str, value: &str, emitter: &dyn Emitter) -> Result<()> {
            self.seen.lock().unwrap().push(value.to_string());
            emitter.emit(value, "1").await
        }
    }

    struct NullReducer;

    #[async_trait]
    impl Reducer for NullReducer {
        async fn reduce(
            &self,
            _key: &str,
            _values: ValueIterator,
            _emitter: &dyn Emitter,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct CountingReducer;

    #[async_trait]
    impl Reducer for CountingReducer {
        async fn reduce(
            &self,
            key: &str,
            mut values: ValueIterator,
            emitter: &dyn Emitter,
        ) -> Result<()> {
            let mut count = 0;
            while values.next().await.is_some() {
                count += 1;
            }
            emitter.emit(key, &count.to_string()).await
        }
    }

    fn context_in(dir: &str, mapper: Arc<dyn Mapper>, reducer: Arc<dyn Reducer>) -> JobContext {
        JobContext {
            mapper,
            reducer,
            fs: Arc::new(LocalFileSystem),
            output_path: dir.to_string(),
            intermediate_bins: 1,
            cleanup: false,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    #[test]
    fn records_split_on_exactly_one_tab() {
        let cases = [
            ("foo\tbar", "foo", "bar"),
            ("foo\tbar\tbaz", "", "foo\tbar\tbaz"),
            ("foo bar baz", "", "foo bar baz"),
            ("key without value\t", "key without value", ""),
            ("\tvalue without key", "", "value without key"),
        ];
        for (record, key, value) in cases {
            assert_eq!(split_record(record), (key, value));
        }
    }

    #[tokio::test]
    async fn each_record_belongs_to_exactly_one_split() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("input");
        std::fs::write(&input, "aaa\nbb\ncccc\n").unwrap();

        let mapper = Arc::new(RecordingMapper {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let dir = tmp.path().to_string_lossy().into_owned();
        let ctx = context_in(&dir, mapper.clone(), Arc::new(NullReducer));

        let file = ctx.fs.stat(&input.to_string_lossy()).await.unwrap();
        let splits = crate::split::split_input_file(&file, 5);
        assert_eq!(splits.len(), 3);

        for (bin_id, split) in splits.iter().enumerate() {
            run_map(&ctx, bin_id as u64, std::slice::from_ref(split))
                .await
                .unwrap();
        }

        let mut seen = mapper.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["aaa", "bb", "cccc"]);
        assert!(ctx.bytes_read.load(Ordering::Relaxed) >= 12);
    }

    #[tokio::test]
    async fn reduce_groups_all_values_for_a_key() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();

        // Two mappers contributed shards to bin 0.
        for (mapper_id, keys) in [(0, vec!["a", "b", "a"]), (1, vec!["b", "a"])] {
            let shard = tmp.path().join(format!("map-bin0-{mapper_id}.out"));
            let mut contents = String::new();
            for key in keys {
                contents.push_str(&serde_json::to_string(&KeyValue::new(key, "1")).unwrap());
                contents.push('\n');
            }
            std::fs::write(shard, contents).unwrap();
        }

        let ctx = context_in(&dir, Arc::new(RecordingMapper {
            seen: std::sync::Mutex::new(Vec::new()),
        }), Arc::new(CountingReducer));
        run_reduce(&ctx, 0).await.unwrap();

        let output = std::fs::read_to_string(tmp.path().join("output-part-0")).unwrap();
        let mut lines: Vec<&str> = output.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a\t3", "b\t2"]);
    }

    #[tokio::test]
    async fn cleanup_removes_the_bin_shards_after_success() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();

        let shard = tmp.path().join("map-bin0-0.out");
        std::fs::write(
            &shard,
            format!("{}\n", serde_json::to_string(&KeyValue::new("k", "v")).unwrap()),
        )
        .unwrap();

        let mut ctx = context_in(&dir, Arc::new(RecordingMapper {
            seen: std::sync::Mutex::new(Vec::new()),
        }), Arc::new(CountingReducer));
        ctx.cleanup = true;

        run_reduce(&ctx, 0).await.unwrap();

        assert!(!shard.exists());
        assert!(tmp.path().join("output-part-0").exists());
    }
}
