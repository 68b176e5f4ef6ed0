use anyhow::Result;
use async_trait::async_trait;
use drover::{Emitter, Mapper, Reducer, ValueIterator};

/// Counts word occurrences across the input. The classic.
pub struct WordCount;

#[async_trait]
impl Mapper for WordCount {
    async fn map(&self, _key: &str, value: &str, emitter: &dyn Emitter) -> Result<()> {
        for word in value.split_whitespace() {
            emitter.emit(word, "1").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reducer for WordCount {
    async fn reduce(
        &self,
        key: &str,
        mut values: ValueIterator,
        emitter: &dyn Emitter,
    ) -> Result<()> {
        let mut count: u64 = 0;
        while values.next().await.is_some() {
            count += 1;
        }
        emitter.emit(key, &count.to_string()).await
    }
}
