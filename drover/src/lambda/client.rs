//! Deploying and invoking the worker Lambda function.
//!
//! Deployment cross-compiles the currently running program for the Lambda
//! target, zips it, and creates or updates the function depending on whether
//! the uploaded code digest and resource configuration drifted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_lambda as lambda;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{FunctionCode, FunctionConfiguration, Runtime};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytesize::ByteSize;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Number of times to try invoking a function before giving up and returning
/// the last error.
const MAX_INVOKE_RETRIES: usize = 3;

/// Target triple the worker binary is cross-compiled for.
const LAMBDA_TARGET: &str = "x86_64-unknown-linux-musl";

/// Entry-point file name inside the deployed archive. The `provided`
/// runtime family executes the archive member with this exact name.
const BOOTSTRAP_FILE: &str = "bootstrap";

/// Resource shape of an individual Lambda function; identity is the name.
#[derive(Clone, Debug)]
pub(crate) struct FunctionConfig {
    pub name: String,
    pub role_arn: String,
    pub timeout: i32,
    pub memory_size: i32,
}

/// The raw outcome of one invocation attempt.
pub(crate) struct RawInvocation {
    pub payload: Option<Vec<u8>>,

    /// Set when the function itself failed; the payload then carries the
    /// service's error envelope.
    pub function_error: Option<String>,
}

/// The one seam between retry logic and the service, so tests can substitute
/// a scripted invoker.
#[async_trait]
pub(crate) trait Invoker: Send + Sync {
    async fn invoke_raw(&self, function_name: &str, payload: Vec<u8>) -> Result<RawInvocation>;
}

struct SdkInvoker {
    client: lambda::Client,
}

#[async_trait]
impl Invoker for SdkInvoker {
    async fn invoke_raw(&self, function_name: &str, payload: Vec<u8>) -> Result<RawInvocation> {
        let output = self
            .client
            .invoke()
            .function_name(function_name)
            .payload(Blob::new(payload))
            .send()
            .await?;

        Ok(RawInvocation {
            payload: output.payload().map(|blob| blob.as_ref().to_vec()),
            function_error: output.function_error().map(str::to_string),
        })
    }
}

/// The function-side error envelope: `errorMessage` plus a stack trace whose
/// frame shape depends on the runtime.
#[derive(Debug, Deserialize)]
struct InvokeError {
    #[serde(rename = "errorMessage")]
    message: String,

    #[serde(rename = "stackTrace", default)]
    stack_trace: Vec<serde_json::Value>,
}

/// Wraps the Lambda API with deploy and invoke operations for the worker
/// function.
pub(crate) struct LambdaClient {
    client: lambda::Client,
    invoker: Arc<dyn Invoker>,
}

impl LambdaClient {
    pub async fn new() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = lambda::Client::new(&config);
        Ok(Self {
            invoker: Arc::new(SdkInvoker {
                client: client.clone(),
            }),
            client,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_invoker(invoker: Arc<dyn Invoker>) -> Self {
        let config = lambda::Config::builder()
            .behavior_version(lambda::config::BehaviorVersion::latest())
            .build();
        Self {
            client: lambda::Client::from_conf(config),
            invoker,
        }
    }

    /// Creates or updates the worker function from the current program.
    pub async fn deploy(&self, function: &FunctionConfig) -> Result<()> {
        let code = build_package().await?;

        let existing = match self
            .client
            .get_function()
            .function_name(&function.name)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err, |e| e.is_resource_not_found_exception()) => {
                info!("creating function '{}'", function.name);
                self.create_function(function, code).await?;
                return Ok(());
            }
            Err(err) => return Err(err).context("looking up function"),
        };

        let deployed = existing
            .configuration()
            .ok_or_else(|| anyhow!("function '{}' has no configuration", function.name))?;

        let mut updated = false;
        if code_needs_update(&code, deployed) {
            info!("updating function code for '{}'", function.name);
            self.client
                .update_function_code()
                .function_name(&function.name)
                .zip_file(Blob::new(code))
                .send()
                .await?;
            updated = true;
        }
        if config_needs_update(function, deployed) {
            info!("updating function configuration for '{}'", function.name);
            self.client
                .update_function_configuration()
                .function_name(&function.name)
                .role(&function.role_arn)
                .timeout(function.timeout)
                .memory_size(function.memory_size)
                .send()
                .await?;
            updated = true;
        }
        if !updated {
            info!("function '{}' is already up-to-date", function.name);
        }
        Ok(())
    }

    async fn create_function(&self, function: &FunctionConfig, code: Vec<u8>) -> Result<()> {
        self.client
            .create_function()
            .function_name(&function.name)
            .role(&function.role_arn)
            .handler("main")
            .runtime(Runtime::Providedal2023)
            .code(FunctionCode::builder().zip_file(Blob::new(code)).build())
            .timeout(function.timeout)
            .memory_size(function.memory_size)
            .send()
            .await?;
        Ok(())
    }

    /// Tears down the worker function. Deleting a function that does not
    /// exist is not an error.
    pub async fn delete_function(&self, function_name: &str) -> Result<()> {
        debug!("deleting function '{function_name}'");
        match self
            .client
            .delete_function()
            .function_name(function_name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err, |e| e.is_resource_not_found_exception()) => Ok(()),
            Err(err) => Err(err).context("deleting function"),
        }
    }

    /// Invokes the function, retrying transport and function-side failures
    /// up to [`MAX_INVOKE_RETRIES`] times. Returns the first successful
    /// response payload, or the last error.
    pub async fn invoke(&self, function_name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut last_error = anyhow!("function '{function_name}' was never invoked");
        for attempt in 1..=MAX_INVOKE_RETRIES {
            match self.try_invoke(function_name, payload).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        "invocation of '{function_name}' failed (attempt {attempt} of {MAX_INVOKE_RETRIES}): {err}"
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn try_invoke(&self, function_name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let output = self
            .invoker
            .invoke_raw(function_name, payload.to_vec())
            .await?;
        let response = output.payload.unwrap_or_default();

        if output.function_error.is_some() {
            let envelope: InvokeError = serde_json::from_slice(&response)
                .context("undecodable function error payload")?;
            if !envelope.stack_trace.is_empty() {
                debug!("function error stack trace:");
                for frame in &envelope.stack_trace {
                    debug!("\t{frame}");
                }
            }
            return Err(anyhow!("function error: {}", envelope.message));
        }

        Ok(response)
    }
}

fn is_not_found<E, R>(err: &aws_sdk_lambda::error::SdkError<E, R>, check: impl Fn(&E) -> bool) -> bool {
    err.as_service_error().map(check).unwrap_or(false)
}

fn code_needs_update(code: &[u8], deployed: &FunctionConfiguration) -> bool {
    let digest = BASE64.encode(Sha256::digest(code));
    Some(digest.as_str()) != deployed.code_sha256()
}

fn config_needs_update(function: &FunctionConfig, deployed: &FunctionConfiguration) -> bool {
    deployed.role() != Some(function.role_arn.as_str())
        || deployed.memory_size() != Some(function.memory_size)
        || deployed.timeout() != Some(function.timeout)
}

/// Cross-compiles the running program and wraps it into a deployable
/// archive.
async fn build_package() -> Result<Vec<u8>> {
    info!("building worker function package");
    let build_dir = tempfile::tempdir()?;
    let binary = cross_compile(build_dir.path()).await?;
    let code = tokio::fs::read(&binary).await?;

    let archive = zip_binary(&code)?;
    debug!(
        "zipped function package size: {}",
        ByteSize::b(archive.len() as u64)
    );
    Ok(archive)
}

/// Rebuilds the current binary for the Lambda target with stripped symbols.
/// Returns the built artifact's location inside `target_dir`.
async fn cross_compile(target_dir: &Path) -> Result<PathBuf> {
    let current = std::env::current_exe()?;
    let bin_name = current
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("cannot determine the running binary's name"))?
        .to_string();

    let output = Command::new("cargo")
        .args(["build", "--release", "--bin", &bin_name])
        .args(["--target", LAMBDA_TARGET])
        .arg("--target-dir")
        .arg(target_dir)
        .env("RUSTFLAGS", "-C strip=symbols")
        .output()
        .await
        .context("running cargo")?;

    if !output.status.success() {
        return Err(anyhow!(
            "cross-compiling {bin_name} failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(target_dir.join(LAMBDA_TARGET).join("release").join(bin_name))
}

/// Zips the worker binary under the runtime's expected entry-point name,
/// world-readable and executable.
fn zip_binary(code: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o755);
        archive.start_file(BOOTSTRAP_FILE, options)?;
        archive.write_all(code)?;
        archive.finish()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails with a function error envelope a fixed number of times, then
    /// succeeds.
    struct FlakyInvoker {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Invoker for FlakyInvoker {
        async fn invoke_raw(&self, _name: &str, _payload: Vec<u8>) -> Result<RawInvocation> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Ok(RawInvocation {
                    payload: Some(
                        serde_json::json!({
                            "errorMessage": "task blew up",
                            "stackTrace": [{"label": "main", "path": "main.rs", "line": 1}],
                        })
                        .to_string()
                        .into_bytes(),
                    ),
                    function_error: Some("Unhandled".to_string()),
                })
            } else {
                Ok(RawInvocation {
                    payload: Some(b"{\"bytesRead\":1,\"bytesWritten\":2}".to_vec()),
                    function_error: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn invoke_retries_through_function_errors() {
        let invoker = Arc::new(FlakyInvoker {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let client = LambdaClient::with_invoker(invoker.clone());

        let payload = client.invoke("worker", b"{}").await.unwrap();
        assert_eq!(payload, b"{\"bytesRead\":1,\"bytesWritten\":2}");
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invoke_gives_up_after_the_retry_budget() {
        let invoker = Arc::new(FlakyInvoker {
            failures: 4,
            calls: AtomicUsize::new(0),
        });
        let client = LambdaClient::with_invoker(invoker.clone());

        let err = client.invoke("worker", b"{}").await.unwrap_err();
        assert!(err.to_string().contains("task blew up"));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn code_digest_comparison_uses_base64_sha256() {
        let code = b"binary bits";
        let digest = BASE64.encode(Sha256::digest(code));

        let matching = FunctionConfiguration::builder()
            .code_sha256(digest)
            .build();
        assert!(!code_needs_update(code, &matching));

        let stale = FunctionConfiguration::builder()
            .code_sha256("somethingelse")
            .build();
        assert!(code_needs_update(code, &stale));
    }

    #[test]
    fn config_drift_is_detected_per_field() {
        let function = FunctionConfig {
            name: "worker".to_string(),
            role_arn: "arn:aws:iam::1:role/worker".to_string(),
            timeout: 180,
            memory_size: 1500,
        };

        let same = FunctionConfiguration::builder()
            .role("arn:aws:iam::1:role/worker")
            .timeout(180)
            .memory_size(1500)
            .build();
        assert!(!config_needs_update(&function, &same));

        let drifted = FunctionConfiguration::builder()
            .role("arn:aws:iam::1:role/worker")
            .timeout(60)
            .memory_size(1500)
            .build();
        assert!(config_needs_update(&function, &drifted));
    }

    #[test]
    fn archive_contains_the_bootstrap_entry() {
        let archive = zip_binary(b"#!/bin/true").unwrap();
        let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let entry = reader.by_index(0).unwrap();
        assert_eq!(entry.name(), BOOTSTRAP_FILE);
        assert_eq!(entry.unix_mode().unwrap() & 0o777, 0o755);
    }
}
