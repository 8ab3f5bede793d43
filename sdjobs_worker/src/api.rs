use std::{fmt, io::Write, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Path of the job endpoint, relative to the API host.
pub const JOBS_ENDPOINT: &str = "/api/train_jobs";

/// Longest wait for a single read or write on an open connection.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InputAsset {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TrainJob {
    pub id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub script: String,
    #[serde(default)]
    pub input_assets: Option<Vec<InputAsset>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub items: Option<Vec<TrainJob>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobResult {
    pub id: String,
    pub status: JobStatus,
    pub result: String,
}

/// The remote side of the worker.
pub trait JobApi {
    /// Fetch pending jobs. `None` means the API returned no job list.
    fn fetch_jobs(&self) -> Result<Option<Vec<TrainJob>>>;

    fn post_result(&self, result: &JobResult) -> Result<()>;

    /// Download `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

/// [`JobApi`] over HTTP, authenticated with the `x-api-key` header.
pub struct HttpJobApi {
    agent: ureq::Agent,
    jobs_url: String,
    api_key: Option<String>,
}

impl HttpJobApi {
    pub fn new(api_host: &str, api_key: Option<String>) -> Self {
        Self::with_io_timeout(api_host, api_key, DEFAULT_IO_TIMEOUT)
    }

    /// Like [`HttpJobApi::new`], failing any call that stalls for `io_timeout` on an open connection.
    pub fn with_io_timeout(api_host: &str, api_key: Option<String>, io_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(io_timeout)
            .timeout_write(io_timeout)
            .build();
        Self {
            agent,
            jobs_url: jobs_url(api_host),
            api_key,
        }
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        match &self.api_key {
            Some(key) => request.set("x-api-key", key),
            None => request,
        }
    }
}

pub(crate) fn jobs_url(api_host: &str) -> String {
    format!("{}{JOBS_ENDPOINT}", api_host.trim_end_matches('/'))
}

impl JobApi for HttpJobApi {
    fn fetch_jobs(&self) -> Result<Option<Vec<TrainJob>>> {
        let list: JobList = self
            .authorized(self.agent.get(&self.jobs_url))
            .call()?
            .into_json()?;
        Ok(list.items)
    }

    fn post_result(&self, result: &JobResult) -> Result<()> {
        info!(
            "Posting job result for {}, status: {}, result: {}",
            result.id, result.status, result.result
        );
        self.authorized(self.agent.post(&self.jobs_url))
            .send_json(result)?;
        Ok(())
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let response = self.agent.get(url).call()?;
        let mut reader = response.into_reader();
        Ok(std::io::copy(&mut reader, dest)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_list() -> Result<()> {
        let list: JobList = serde_json::from_str(
            r#"{"items": [{
                "id": "job-1",
                "params": {"prompt": "a cat", "steps": 25},
                "script": "echo hi",
                "input_assets": [{"name": "ref.png", "url": "https://example.com/ref.png"}]
            }, {
                "id": "job-2",
                "script": "true"
            }]}"#,
        )?;
        let items = list.items.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].params["steps"], 25);
        assert_eq!(
            items[0].input_assets.as_ref().unwrap()[0],
            InputAsset {
                name: "ref.png".to_string(),
                url: "https://example.com/ref.png".to_string(),
            }
        );
        assert!(items[1].params.is_null());
        assert_eq!(items[1].input_assets, None);

        let empty: JobList = serde_json::from_str("{}")?;
        assert!(empty.items.is_none());
        Ok(())
    }

    #[test]
    fn serializes_result() -> Result<()> {
        let result = JobResult {
            id: "job-1".to_string(),
            status: JobStatus::Error,
            result: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&result)?,
            serde_json::json!({"id": "job-1", "status": "error", "result": "boom"})
        );
        Ok(())
    }

    #[test]
    fn stalled_server_times_out() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let host = format!("http://{}", listener.local_addr()?);
        let server = std::thread::spawn(move || {
            // Accept and never answer.
            if let Ok((stream, _)) = listener.accept() {
                std::thread::sleep(Duration::from_secs(3));
                drop(stream);
            }
        });

        let api = HttpJobApi::with_io_timeout(&host, None, Duration::from_millis(200));
        let start = std::time::Instant::now();
        assert!(api.fetch_jobs().is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn endpoint_url() {
        assert_eq!(
            jobs_url("http://discotalk.app/"),
            "http://discotalk.app/api/train_jobs"
        );
        assert_eq!(
            jobs_url("http://localhost:3000"),
            "http://localhost:3000/api/train_jobs"
        );
    }
}
