use std::{path::PathBuf, time::Duration};

use clap::Parser;
use sdjobs_worker::{HttpJobApi, Worker, WorkerConfig};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

const DEFAULT_API_HOST: &str = "http://discotalk.app";

#[derive(Parser)]
#[command(about = "Fetch jobs from the job API, run them and report results")]
struct Args {
    /// Base URL of the job API.
    #[arg(long, env = "SDJOBS_API_HOST", default_value = DEFAULT_API_HOST)]
    api_host: String,

    /// API key sent as `x-api-key`.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory holding one subdirectory per job.
    #[arg(long, default_value = "./jobs")]
    jobs_dir: PathBuf,

    /// Seconds to wait after a poll that returned no jobs or failed.
    #[arg(long, default_value_t = 5)]
    idle_secs: u64,

    /// Poll once, run what was returned and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("polling {} for jobs", args.api_host);
    let worker = Worker::new(
        HttpJobApi::new(&args.api_host, args.api_key),
        WorkerConfig {
            jobs_dir: args.jobs_dir,
            idle_interval: Duration::from_secs(args.idle_secs),
        },
    );

    if args.once {
        let ran = worker.run_once()?;
        info!("ran {ran} jobs");
        Ok(())
    } else {
        worker.run()
    }
}
