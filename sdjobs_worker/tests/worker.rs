use std::{cell::RefCell, collections::VecDeque, fs, io::Write, time::Duration};

use anyhow::Result;
use sdjobs_worker::{
    InputAsset, JobApi, JobResult, JobStatus, TrainJob, Worker, WorkerConfig,
};

/// In-memory job API: serves queued polls and records posted results.
#[derive(Default)]
struct FakeApi {
    polls: RefCell<VecDeque<Result<Option<Vec<TrainJob>>>>>,
    posted: RefCell<Vec<JobResult>>,
    reject_posts: bool,
}

impl FakeApi {
    fn with_polls(polls: Vec<Result<Option<Vec<TrainJob>>>>) -> Self {
        Self {
            polls: RefCell::new(polls.into()),
            ..Default::default()
        }
    }
}

impl JobApi for FakeApi {
    fn fetch_jobs(&self) -> Result<Option<Vec<TrainJob>>> {
        self.polls.borrow_mut().pop_front().unwrap_or(Ok(None))
    }

    fn post_result(&self, result: &JobResult) -> Result<()> {
        if self.reject_posts {
            anyhow::bail!("503 Service Unavailable");
        }
        self.posted.borrow_mut().push(result.clone());
        Ok(())
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let body = url.trim_start_matches("mem://");
        dest.write_all(body.as_bytes())?;
        Ok(body.len() as u64)
    }
}

fn job(id: &str, script: &str) -> TrainJob {
    TrainJob {
        id: id.to_string(),
        params: serde_json::json!({"prompt": "a lighthouse"}),
        script: script.to_string(),
        input_assets: None,
    }
}

fn worker(api: FakeApi, dir: &std::path::Path) -> Worker<FakeApi> {
    Worker::new(
        api,
        WorkerConfig {
            jobs_dir: dir.to_path_buf(),
            idle_interval: Duration::from_millis(1),
        },
    )
}

#[test]
fn empty_polls_run_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let worker = worker(
        FakeApi::with_polls(vec![Ok(None), Ok(Some(Vec::new()))]),
        dir.path(),
    );
    assert_eq!(worker.run_once()?, 0);
    assert_eq!(worker.run_once()?, 0);
    assert!(worker.api().posted.borrow().is_empty());
    Ok(())
}

#[test]
fn poll_failure_is_returned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let worker = worker(
        FakeApi::with_polls(vec![Err(anyhow::anyhow!("connection refused"))]),
        dir.path(),
    );
    assert!(worker.run_once().is_err());
    Ok(())
}

#[test]
fn reports_stdout_on_success_and_stderr_on_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let jobs = vec![
        job("ok", "echo generated 96 images\n"),
        job("broken", "echo partial\necho CUDA out of memory >&2\nexit 1\n"),
    ];
    let worker = worker(FakeApi::with_polls(vec![Ok(Some(jobs))]), dir.path());

    assert_eq!(worker.run_once()?, 2);

    let posted = worker.api().posted.borrow();
    assert_eq!(
        *posted,
        vec![
            JobResult {
                id: "ok".to_string(),
                status: JobStatus::Success,
                result: "generated 96 images\n".to_string(),
            },
            JobResult {
                id: "broken".to_string(),
                status: JobStatus::Error,
                result: "CUDA out of memory\n".to_string(),
            },
        ]
    );
    assert!(dir.path().join("ok").join("script.sh").is_file());
    assert!(dir.path().join("broken").join("params.json").is_file());
    Ok(())
}

#[test]
fn scripts_see_their_inputs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut with_assets = job("assets", "cat input/prompt.txt\n");
    with_assets.input_assets = Some(vec![InputAsset {
        name: "prompt.txt".to_string(),
        url: "mem://a red fox".to_string(),
    }]);
    let worker = worker(FakeApi::default(), dir.path());

    assert_eq!(worker.run_job(&with_assets)?, JobStatus::Success);
    assert_eq!(worker.api().posted.borrow()[0].result, "a red fox");
    assert_eq!(
        fs::read_to_string(dir.path().join("assets").join("input").join("prompt.txt"))?,
        "a red fox"
    );
    Ok(())
}

#[test]
fn invalid_jobs_are_reported_as_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let worker = worker(FakeApi::default(), dir.path());

    let result = worker.execute(&job("../outside", "true"));
    assert_eq!(result.status, JobStatus::Error);
    assert!(result.result.contains("not a valid directory name"));
    assert!(!dir.path().join("..").join("outside").exists());
    Ok(())
}

#[test]
fn post_failures_do_not_stop_the_batch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let api = FakeApi {
        reject_posts: true,
        ..FakeApi::with_polls(vec![Ok(Some(vec![job("a", "true"), job("b", "true")]))])
    };
    let worker = worker(api, dir.path());

    assert_eq!(worker.run_once()?, 2);
    assert!(dir.path().join("a").is_dir());
    assert!(dir.path().join("b").is_dir());
    Ok(())
}

#[test]
fn idles_only_after_empty_or_failed_polls() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let idle = Duration::from_millis(1);
    let worker = worker(
        FakeApi::with_polls(vec![
            Ok(None),
            Ok(Some(Vec::new())),
            Err(anyhow::anyhow!("connection reset")),
            Ok(Some(vec![job("busy", "true")])),
        ]),
        dir.path(),
    );

    assert_eq!(worker.tick(), idle);
    assert_eq!(worker.tick(), idle);
    assert_eq!(worker.tick(), idle);
    assert_eq!(worker.tick(), Duration::ZERO);
    assert_eq!(worker.api().posted.borrow().len(), 1);
    assert_eq!(worker.api().posted.borrow()[0].status, JobStatus::Success);
    Ok(())
}
