use drover::{Driver, Job};
use workload::WordCount;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let job = Job::new(WordCount, WordCount);
    Driver::new(job).main().await
}
