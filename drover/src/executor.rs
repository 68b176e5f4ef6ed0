//! Dispatch of (job, task) pairs to wherever they execute.
//!
//! The local executor calls straight into the task bodies on this process;
//! the Lambda executor serializes a task descriptor and sends it through the
//! remote-function client, folding the returned byte counters back into the
//! job.

use std::sync::atomic::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

use crate::config::Config;
use crate::fs::FileSystemKind;
use crate::job::{self, JobContext};
use crate::lambda::{FunctionConfig, IamClient, LambdaClient, EXECUTION_ROLE_NAME};
use crate::split::InputSplit;
use crate::task::{Phase, Task, TaskResult};

#[async_trait]
pub(crate) trait Executor: Send + Sync {
    async fn run_mapper(
        &self,
        ctx: &JobContext,
        job_number: usize,
        bin_id: u64,
        splits: Vec<InputSplit>,
    ) -> Result<()>;

    async fn run_reducer(&self, ctx: &JobContext, job_number: usize, bin_id: u64) -> Result<()>;
}

/// Runs tasks in-process.
pub(crate) struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn run_mapper(
        &self,
        ctx: &JobContext,
        _job_number: usize,
        bin_id: u64,
        splits: Vec<InputSplit>,
    ) -> Result<()> {
        job::run_map(ctx, bin_id, &splits).await
    }

    async fn run_reducer(&self, ctx: &JobContext, _job_number: usize, bin_id: u64) -> Result<()> {
        job::run_reduce(ctx, bin_id).await
    }
}

/// Runs each task as one invocation of the deployed worker function.
pub(crate) struct LambdaExecutor {
    client: LambdaClient,
    function_name: String,
}

impl LambdaExecutor {
    /// Deploys (or refreshes) the worker function and the role it runs
    /// under, and returns an executor bound to it.
    pub async fn deploy(config: &Config) -> Result<Self> {
        let client = LambdaClient::new().await?;

        let role_arn = if config.manage_role {
            IamClient::new()
                .await?
                .deploy_permissions(EXECUTION_ROLE_NAME)
                .await?
        } else {
            config.role_arn.clone()
        };

        let function = FunctionConfig {
            name: config.function_name.clone(),
            role_arn,
            timeout: config.function_timeout,
            memory_size: config.function_memory,
        };
        client.deploy(&function).await?;

        Ok(Self {
            client,
            function_name: config.function_name.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_client(client: LambdaClient, function_name: impl Into<String>) -> Self {
        Self {
            client,
            function_name: function_name.into(),
        }
    }

    async fn dispatch(&self, ctx: &JobContext, task: Task) -> Result<()> {
        let payload = serde_json::to_vec(&task)?;
        let response = self.client.invoke(&self.function_name, &payload).await;

        if let Ok(payload) = &response {
            let result = decode_task_result(payload);
            ctx.bytes_read.fetch_add(result.bytes_read, Ordering::Relaxed);
            ctx.bytes_written
                .fetch_add(result.bytes_written, Ordering::Relaxed);
        }

        response.map(|_| ())
    }
}

/// Decodes a worker's response payload, tolerating an extra layer of JSON
/// string quoting. An undecodable payload counts as zero bytes.
fn decode_task_result(payload: &[u8]) -> TaskResult {
    if let Ok(result) = serde_json::from_slice::<TaskResult>(payload) {
        return result;
    }
    if let Ok(inner) = serde_json::from_slice::<String>(payload) {
        if let Ok(result) = serde_json::from_str::<TaskResult>(&inner) {
            return result;
        }
    }
    error!("undecodable task result payload");
    TaskResult::default()
}

#[async_trait]
impl Executor for LambdaExecutor {
    async fn run_mapper(
        &self,
        ctx: &JobContext,
        job_number: usize,
        bin_id: u64,
        splits: Vec<InputSplit>,
    ) -> Result<()> {
        let task = Task {
            job_number,
            phase: Phase::Map,
            bin_id,
            intermediate_bins: ctx.intermediate_bins,
            splits,
            file_system_kind: FileSystemKind::S3,
            working_location: ctx.output_path.clone(),
            cleanup: false,
        };
        self.dispatch(ctx, task).await
    }

    async fn run_reducer(&self, ctx: &JobContext, job_number: usize, bin_id: u64) -> Result<()> {
        let task = Task {
            job_number,
            phase: Phase::Reduce,
            bin_id,
            intermediate_bins: ctx.intermediate_bins,
            splits: Vec::new(),
            file_system_kind: FileSystemKind::S3,
            working_location: ctx.output_path.clone(),
            cleanup: ctx.cleanup,
        };
        self.dispatch(ctx, task).await
    }
}
