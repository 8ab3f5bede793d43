use std::{path::PathBuf, thread, time::Duration};

use anyhow::Result;
use tracing::{error, info};

use crate::{
    api::{JobApi, JobResult, JobStatus, TrainJob},
    job::{download_input_assets, prepare_job, run_script},
};

/// Wait between polls when there is nothing to do.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub jobs_dir: PathBuf,
    pub idle_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("./jobs"),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

/// Polls a [`JobApi`] and runs each job's script in its own directory, one job at a time.
pub struct Worker<A> {
    api: A,
    config: WorkerConfig,
}

impl<A: JobApi> Worker<A> {
    pub fn new(api: A, config: WorkerConfig) -> Self {
        Self { api, config }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Prepare and run a job without reporting it.
    pub fn execute(&self, job: &TrainJob) -> JobResult {
        let outcome = prepare_job(&self.config.jobs_dir, job).and_then(|paths| {
            download_input_assets(&self.api, &paths.dir, job)?;
            info!(
                "Running job {} in subprocess, path: {}",
                job.id,
                paths.dir.display()
            );
            run_script(&paths.dir)
        });

        let (status, result) = match outcome {
            Ok(output) if output.success => {
                info!("Job {} finished successfully", job.id);
                (JobStatus::Success, output.stdout)
            }
            Ok(output) => {
                error!("Job {} failed", job.id);
                (JobStatus::Error, output.stderr)
            }
            Err(e) => {
                error!("Job {} could not be run: {e:#}", job.id);
                (JobStatus::Error, format!("{e:#}"))
            }
        };
        JobResult {
            id: job.id.clone(),
            status,
            result,
        }
    }

    /// Run a job and post its result.
    pub fn run_job(&self, job: &TrainJob) -> Result<JobStatus> {
        let result = self.execute(job);
        self.api.post_result(&result)?;
        Ok(result.status)
    }

    /// Poll once and run every job returned. Returns the number of jobs run.
    pub fn run_once(&self) -> Result<usize> {
        let Some(jobs) = self.api.fetch_jobs()? else {
            return Ok(0);
        };
        if jobs.is_empty() {
            return Ok(0);
        }

        info!("Got {} train jobs", jobs.len());
        for job in &jobs {
            if let Err(e) = self.run_job(job) {
                error!("could not post result of job {}: {e:#}", job.id);
            }
        }
        Ok(jobs.len())
    }

    /// One poll of [`Worker::run`]. Returns how long to wait before the next poll: `idle_interval`
    /// after an empty or failed poll, nothing after jobs ran.
    pub fn tick(&self) -> Duration {
        match self.run_once() {
            Ok(0) => {
                info!("No train jobs to run");
                self.config.idle_interval
            }
            Ok(_) => Duration::ZERO,
            Err(e) => {
                error!("polling for jobs failed: {e:#}");
                self.config.idle_interval
            }
        }
    }

    /// Poll forever.
    pub fn run(&self) -> Result<()> {
        loop {
            let wait = self.tick();
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
    }
}
