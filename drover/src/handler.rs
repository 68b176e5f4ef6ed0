//! Remote-worker entry point.
//!
//! When the process finds itself inside the Lambda runtime it stops being a
//! driver and serves tasks instead: poll the runtime interface for the next
//! invocation, decode the task, execute it against the job resolved from the
//! process-wide job list, and report the byte counters back.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::fs;
use crate::job::{self, JobContext};
use crate::task::{Phase, Task, TaskResult};
use crate::Driver;

const RUNTIME_API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

/// Environment variables the Lambda runtime always sets. All of them must be
/// present for the process to consider itself a remote worker.
const RUNTIME_MARKERS: [&str; 3] = [
    "LAMBDA_TASK_ROOT",
    "AWS_EXECUTION_ENV",
    "LAMBDA_RUNTIME_DIR",
];

/// Infers whether the program is running under the Lambda runtime.
pub(crate) fn running_in_lambda() -> bool {
    markers_present(|name| std::env::var(name).ok())
}

fn markers_present(lookup: impl Fn(&str) -> Option<String>) -> bool {
    RUNTIME_MARKERS
        .iter()
        .all(|name| lookup(name).map(|value| !value.is_empty()).unwrap_or(false))
}

/// The error envelope posted back to the runtime when a task cannot be
/// completed.
#[derive(Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "errorMessage")]
    error_message: String,

    #[serde(rename = "errorType")]
    error_type: &'static str,

    #[serde(rename = "stackTrace")]
    stack_trace: Vec<String>,
}

/// Serves tasks from the runtime interface until the instance is reclaimed.
pub(crate) async fn serve(driver: &Driver) -> Result<()> {
    let api =
        std::env::var("AWS_LAMBDA_RUNTIME_API").context("AWS_LAMBDA_RUNTIME_API is not set")?;
    let client = reqwest::Client::new();

    info!("serving as a remote worker");
    loop {
        if let Err(err) = poll_one(&client, &api, driver).await {
            error!("runtime loop error: {err}");
        }
    }
}

async fn poll_one(client: &reqwest::Client, api: &str, driver: &Driver) -> Result<()> {
    let response = client
        .get(format!(
            "http://{api}/{RUNTIME_API_VERSION}/runtime/invocation/next"
        ))
        .send()
        .await?;
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.bytes().await?;

    let task: Task = match serde_json::from_slice(&body) {
        Ok(task) => task,
        Err(err) => {
            return post_error(client, api, &request_id, &anyhow!("undecodable task: {err}"))
                .await;
        }
    };

    let (result, failure) = execute_task(driver, task).await;
    match failure {
        None => post_result(client, api, &request_id, &result).await,
        Some(err) => {
            error!("task failed: {err}");
            post_error(client, api, &request_id, &err).await
        }
    }
}

async fn post_result(
    client: &reqwest::Client,
    api: &str,
    request_id: &str,
    result: &TaskResult,
) -> Result<()> {
    client
        .post(format!(
            "http://{api}/{RUNTIME_API_VERSION}/runtime/invocation/{request_id}/response"
        ))
        .json(result)
        .send()
        .await?;
    Ok(())
}

async fn post_error(
    client: &reqwest::Client,
    api: &str,
    request_id: &str,
    err: &anyhow::Error,
) -> Result<()> {
    let envelope = ErrorEnvelope {
        error_message: format!("{err:#}"),
        error_type: "TaskError",
        stack_trace: Vec::new(),
    };
    client
        .post(format!(
            "http://{api}/{RUNTIME_API_VERSION}/runtime/invocation/{request_id}/error"
        ))
        .json(&envelope)
        .send()
        .await?;
    Ok(())
}

/// Executes one task against the driver's job list. A fresh context is bound
/// per invocation: warm instances reuse the process, so the byte counters
/// must start from zero every time.
pub(crate) async fn execute_task(driver: &Driver, task: Task) -> (TaskResult, Option<anyhow::Error>) {
    let Some(registered) = driver.jobs().get(task.job_number) else {
        return (
            TaskResult::default(),
            Some(anyhow!("unknown job number {}", task.job_number)),
        );
    };

    let fs = match fs::init_filesystem(task.file_system_kind).await {
        Ok(fs) => fs,
        Err(err) => return (TaskResult::default(), Some(err)),
    };

    let ctx = JobContext::bind(
        registered,
        fs,
        &task.working_location,
        task.intermediate_bins,
        task.cleanup,
    );

    let outcome = match task.phase {
        Phase::Map => job::run_map(&ctx, task.bin_id, &task.splits).await,
        Phase::Reduce => job::run_reduce(&ctx, task.bin_id).await,
    };

    (ctx.result(), outcome.err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemKind;
    use crate::{Emitter, Job, Mapper, Reducer, ValueIterator};
    use async_trait::async_trait;

    struct Identity;

    #[async_trait]
    impl Mapper for Identity {
        async fn map(&self, key: &str, value: &str, emitter: &dyn Emitter) -> Result<()> {
            emitter.emit(key, value).await
        }
    }

    #[async_trait]
    impl Reducer for Identity {
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

    #[test]
    fn runtime_detection_needs_every_marker() {
        assert!(!markers_present(|_| None));
        assert!(!markers_present(|name| {
            (name == "LAMBDA_TASK_ROOT").then(|| "/var/task".to_string())
        }));
        assert!(!markers_present(|_| Some(String::new())));
        assert!(markers_present(|_| Some("value".to_string())));
    }

    #[tokio::test]
    async fn tasks_start_with_zeroed_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = Driver::new(Job::new(Identity, Identity));

        let task = Task {
            job_number: 0,
            phase: Phase::Map,
            bin_id: 0,
            intermediate_bins: 10,
            splits: Vec::new(),
            file_system_kind: FileSystemKind::Local,
            working_location: tmp.path().to_string_lossy().into_owned(),
            cleanup: false,
        };

        let (result, failure) = execute_task(&driver, task.clone()).await;
        assert!(failure.is_none());
        assert_eq!(result.bytes_read, 0);
        assert_eq!(result.bytes_written, 0);

        let reduce = Task {
            phase: Phase::Reduce,
            ..task
        };
        let (result, failure) = execute_task(&driver, reduce).await;
        assert!(failure.is_none());
        assert_eq!(result.bytes_read, 0);
        assert_eq!(result.bytes_written, 0);
    }

    #[tokio::test]
    async fn unknown_job_numbers_fail_without_running() {
        let driver = Driver::new(Job::new(Identity, Identity));
        let task = Task {
            job_number: 3,
            phase: Phase::Map,
            bin_id: 0,
            intermediate_bins: 1,
            splits: Vec::new(),
            file_system_kind: FileSystemKind::Local,
            working_location: ".".to_string(),
            cleanup: false,
        };

        let (result, failure) = execute_task(&driver, task).await;
        assert!(failure.is_some());
        assert_eq!(result.bytes_read, 0);
    }
}
