use anyhow::Result;
use async_trait::async_trait;
use drover::{Emitter, Mapper, Reducer, ValueIterator};

/// Forwards only records whose key starts with a prefix; useful as a later
/// stage of a pipeline. Reduce is the identity.
pub struct PrefixFilter {
    prefix: String,
}

impl PrefixFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Mapper for PrefixFilter {
    async fn map(&self, key: &str, value: &str, emitter: &dyn Emitter) -> Result<()> {
        if key.starts_with(&self.prefix) {
            emitter.emit(key, value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reducer for PrefixFilter {
    async fn reduce(
        &self,
        key: &str,
        mut values: ValueIterator,
        emitter: &dyn Emitter,
    ) -> Result<()> {
        while let Some(value) = values.next().await {
            emitter.emit(key, &value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover::{Driver, Job};

    #[tokio::test]
    async fn two_stage_count_then_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().into_owned();
        std::fs::write(
            tmp.path().join("input"),
            "the test input\nthe input test\nfoo bar baz",
        )
        .unwrap();

        let count = Job::new(crate::WordCount, crate::WordCount);
        let keep_t = Job::new(PrefixFilter::new("t"), PrefixFilter::new("t"));

        Driver::multi_stage(vec![count, keep_t])
            .with_inputs([dir.clone()])
            .with_working_location(dir)
            .run()
            .await
            .unwrap();

        let output =
            std::fs::read_to_string(tmp.path().join("job1").join("output-part-0")).unwrap();
        let mut lines: Vec<&str> = output.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["test\t2", "the\t2"]);
    }
}
