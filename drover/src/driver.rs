//! The driver orchestrates a run: splitting inputs, fanning out map and
//! reduce tasks through an executor, and chaining jobs in a multi-stage
//! pipeline.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytesize::ByteSize;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::executor::{Executor, LambdaExecutor, LocalExecutor};
use crate::fs::{self, FileSystem};
use crate::handler;
use crate::job::JobContext;
use crate::lambda::{IamClient, LambdaClient, EXECUTION_ROLE_NAME};
use crate::split::{intermediate_bins, pack_input_splits, split_input_file, InputSplit};
use crate::Job;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// Input paths: files, directories, or globs, local or in S3
    inputs: Vec<String>,

    /// Run map and reduce tasks as Lambda invocations
    #[arg(long)]
    lambda: bool,

    /// Output location (local path or s3:// prefix)
    #[arg(short, long)]
    out: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Tear down the deployed worker function and role, then exit
    #[arg(long)]
    undeploy: bool,
}

/// Controls the execution of one or more MapReduce jobs.
pub struct Driver {
    jobs: Vec<Job>,
    config: Config,
    use_lambda: bool,
}

impl Driver {
    /// A driver for a single job, configured from the settings file and
    /// environment.
    pub fn new(job: Job) -> Self {
        Self::multi_stage(vec![job])
    }

    /// A driver running `jobs` in sequence, each stage reading the previous
    /// stage's outputs.
    pub fn multi_stage(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            config: Config::load(),
            use_lambda: false,
        }
    }

    pub fn with_split_size(mut self, split_size: u64) -> Self {
        self.config.split_size = split_size;
        self
    }

    pub fn with_map_bin_size(mut self, map_bin_size: u64) -> Self {
        self.config.map_bin_size = map_bin_size;
        self
    }

    pub fn with_reduce_bin_size(mut self, reduce_bin_size: u64) -> Self {
        self.config.reduce_bin_size = reduce_bin_size;
        self
    }

    pub fn with_working_location(mut self, location: impl Into<String>) -> Self {
        self.config.working_location = location.into();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.config.cleanup = cleanup;
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function_name = name.into();
        self
    }

    pub fn with_function_memory(mut self, megabytes: i32) -> Self {
        self.config.function_memory = megabytes;
        self
    }

    pub fn with_function_timeout(mut self, seconds: i32) -> Self {
        self.config.function_timeout = seconds;
        self
    }

    pub fn with_manage_role(mut self, manage_role: bool) -> Self {
        self.config.manage_role = manage_role;
        self
    }

    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.config.role_arn = role_arn.into();
        self
    }

    /// Selects the Lambda executor, deploying the worker function before the
    /// run starts.
    pub fn with_lambda(mut self) -> Self {
        self.use_lambda = true;
        self
    }

    pub(crate) fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Starts the driver. When the process was itself launched by the Lambda
    /// runtime this instead serves tasks and never returns.
    pub async fn run(mut self) -> Result<()> {
        if handler::running_in_lambda() {
            return handler::serve(&self).await;
        }
        self.execute().await
    }

    /// Starts the driver with configuration taken from the command line:
    /// positional input paths, `--lambda`, `--out`, `--verbose`,
    /// `--undeploy`.
    pub async fn main(mut self) -> Result<()> {
        if handler::running_in_lambda() {
            return handler::serve(&self).await;
        }

        let args = CliArgs::parse();

        let default_level = if args.verbose || self.config.verbose {
            "debug"
        } else {
            "info"
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .try_init()
            .ok();

        if args.undeploy {
            return self.undeploy().await;
        }

        self.config.inputs.extend(args.inputs);
        if let Some(out) = args.out {
            self.config.working_location = out;
        }
        self.use_lambda = args.lambda;

        if self.config.inputs.is_empty() {
            error!("no inputs!");
            std::process::exit(1);
        }

        let start = Instant::now();
        self.execute().await?;
        info!("job execution took {:.2?}", start.elapsed());
        Ok(())
    }

    async fn undeploy(&self) -> Result<()> {
        info!("undeploying worker function");
        LambdaClient::new()
            .await?
            .delete_function(&self.config.function_name)
            .await?;

        info!("undeploying IAM permissions");
        IamClient::new()
            .await?
            .delete_permissions(EXECUTION_ROLE_NAME)
            .await?;
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        self.config.clamp_split_size();

        let executor: Arc<dyn Executor> = if self.use_lambda {
            Arc::new(LambdaExecutor::deploy(&self.config).await?)
        } else {
            Arc::new(LocalExecutor)
        };

        if self.config.inputs.is_empty() {
            return Err(anyhow!("no inputs"));
        }

        let mut inputs = self.config.inputs.clone();
        let job_count = self.jobs.len();

        for (job_number, job) in self.jobs.iter().enumerate() {
            let fs = fs::infer_filesystem(&inputs[0]).await?;
            let output_path = if job_count == 1 {
                self.config.working_location.clone()
            } else {
                fs.join(&[&self.config.working_location, &format!("job{job_number}")])
            };

            let (splits, total_bytes) = self.compute_splits(fs.as_ref(), &inputs).await;
            debug!("job {job_number}: {} input splits", splits.len());

            let bins = pack_input_splits(splits, self.config.map_bin_size);
            debug!("job {job_number}: {} input bins", bins.len());

            let ctx = JobContext::bind(
                job,
                fs.clone(),
                &output_path,
                intermediate_bins(total_bytes, self.config.reduce_bin_size),
                self.config.cleanup,
            );

            self.run_map_phase(&ctx, job_number, bins, &executor).await;
            self.run_reduce_phase(&ctx, job_number, &executor).await;

            let result = ctx.result();
            info!(
                "job {job_number}: read {}, wrote {}",
                ByteSize::b(result.bytes_read),
                ByteSize::b(result.bytes_written)
            );

            inputs = vec![fs.join(&[&output_path, "output-*"])];
        }

        Ok(())
    }

    /// Expands the input paths into byte-range splits. Inputs that cannot be
    /// listed are skipped with a warning.
    async fn compute_splits(
        &self,
        fs: &dyn FileSystem,
        inputs: &[String],
    ) -> (Vec<InputSplit>, u64) {
        let mut splits = Vec::new();
        let mut total_bytes = 0;

        for input in inputs {
            let files = match fs.list_files(input).await {
                Ok(files) => files,
                Err(err) => {
                    warn!("unable to load input {input}: {err}");
                    continue;
                }
            };
            for file in files {
                total_bytes += file.size;
                splits.extend(split_input_file(&file, self.config.split_size));
            }
        }

        (splits, total_bytes)
    }

    async fn run_map_phase(
        &self,
        ctx: &Arc<JobContext>,
        job_number: usize,
        bins: Vec<Vec<InputSplit>>,
        executor: &Arc<dyn Executor>,
    ) {
        let bar = phase_bar("Map", bins.len() as u64);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut handles = Vec::new();
        for (bin_id, bin) in bins.into_iter().enumerate() {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let ctx = ctx.clone();
            let executor = executor.clone();
            let bar = bar.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = executor
                    .run_mapper(&ctx, job_number, bin_id as u64, bin)
                    .await
                {
                    error!("error when running mapper {bin_id}: {err}");
                }
                bar.inc(1);
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!("map task panicked: {err}");
            }
        }
        bar.finish();
    }

    async fn run_reduce_phase(
        &self,
        ctx: &Arc<JobContext>,
        job_number: usize,
        executor: &Arc<dyn Executor>,
    ) {
        let bar = phase_bar("Reduce", ctx.intermediate_bins);

        let mut handles = Vec::new();
        for bin_id in 0..ctx.intermediate_bins {
            let ctx = ctx.clone();
            let executor = executor.clone();
            let bar = bar.clone();

            handles.push(tokio::spawn(async move {
                if let Err(err) = executor.run_reducer(&ctx, job_number, bin_id).await {
                    error!("error when running reducer {bin_id}: {err}");
                }
                bar.inc(1);
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!("reduce task panicked: {err}");
            }
        }
        bar.finish();
    }
}

fn phase_bar(prefix: &str, len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{prefix:>6} [{bar:40}] {pos}/{len}")
            .expect("static template")
            .progress_chars("=> "),
    );
    bar.set_prefix(prefix.to_string());
    bar
}
