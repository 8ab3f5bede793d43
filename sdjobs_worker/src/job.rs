use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{JobApi, TrainJob};

pub const PARAMS_FILE: &str = "params.json";
pub const SCRIPT_FILE: &str = "script.sh";
pub const INPUT_DIR: &str = "input";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job id `{0}` is not a valid directory name")]
    InvalidJobId(String),
    #[error("asset name `{0}` is not a valid file name")]
    InvalidAssetName(String),
}

/// Whether `name` can be used as a single path component below a directory we own.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub params_file: PathBuf,
    pub script_file: PathBuf,
}

/// Create `{jobs_dir}/{id}` and write the job's params and script into it.
pub fn prepare_job(jobs_dir: &Path, job: &TrainJob) -> Result<JobPaths> {
    if !is_plain_name(&job.id) {
        return Err(JobError::InvalidJobId(job.id.clone()).into());
    }
    let dir = jobs_dir.join(&job.id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("could not create job directory {}", dir.display()))?;

    let params_file = dir.join(PARAMS_FILE);
    fs::write(&params_file, serde_json::to_string(&job.params)?)?;

    let script_file = dir.join(SCRIPT_FILE);
    fs::write(&script_file, &job.script)?;

    Ok(JobPaths {
        dir,
        params_file,
        script_file,
    })
}

/// Download the job's input assets to `{job_dir}/input`. Returns the files that were kept.
pub fn download_input_assets<A: JobApi + ?Sized>(
    api: &A,
    job_dir: &Path,
    job: &TrainJob,
) -> Result<Vec<PathBuf>> {
    let assets_dir = job_dir.join(INPUT_DIR);
    fs::create_dir_all(&assets_dir)?;

    let Some(assets) = &job.input_assets else {
        return Ok(Vec::new());
    };

    let mut kept = Vec::new();
    for asset in assets {
        if !is_plain_name(&asset.name) {
            return Err(JobError::InvalidAssetName(asset.name.clone()).into());
        }
        info!("Downloading asset {} for job {}", asset.name, job.id);
        let asset_path = assets_dir.join(&asset.name);
        let mut file = File::create(&asset_path)?;
        let written = api
            .download(&asset.url, &mut file)
            .with_context(|| format!("downloading asset {} from {}", asset.name, asset.url))?;
        drop(file);

        if written == 0 {
            warn!("Asset {} is empty", asset.name);
            fs::remove_file(&asset_path)?;
            continue;
        }
        kept.push(asset_path);
    }
    Ok(kept)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `bash script.sh` inside `job_dir`, capturing its output.
pub fn run_script(job_dir: &Path) -> Result<ScriptOutput> {
    let output = Command::new("bash")
        .arg(SCRIPT_FILE)
        .current_dir(job_dir)
        .output()
        .context("could not start bash")?;

    Ok(ScriptOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
