//! Job worker: fetches jobs from a job API, runs each job's shell script in its own directory and
//! reports the script's output back.
//!
//! ```rust,no_run
//! use sdjobs_worker::{HttpJobApi, Worker, WorkerConfig};
//!
//! let api = HttpJobApi::new("http://localhost:3000", std::env::var("API_KEY").ok());
//! Worker::new(api, WorkerConfig::default()).run()?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod api;
mod job;
mod worker;

pub use api::{
    HttpJobApi, InputAsset, JobApi, JobList, JobResult, JobStatus, TrainJob, DEFAULT_IO_TIMEOUT,
    JOBS_ENDPOINT,
};
pub use job::{
    download_input_assets, prepare_job, run_script, JobError, JobPaths, ScriptOutput, INPUT_DIR,
    PARAMS_FILE, SCRIPT_FILE,
};
pub use worker::{Worker, WorkerConfig, DEFAULT_IDLE_INTERVAL};
