//! Thin HTTP client for the daemon's control API.

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sortie_api::{ControlResponse, StatusResponse};
use sortie_core::task::{IssueNumber, Task};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to reach the daemon at all, as opposed to an error response.
#[derive(Debug, thiserror::Error)]
#[error("daemon not reachable at {0}")]
pub struct Unreachable(pub String);

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// `addr` is either a bind address (`127.0.0.1:7878`) or a full URL.
    pub fn new(addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base_url(addr),
        })
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get_json("/api/v1/status").await
    }

    pub async fn queue(&self) -> Result<Vec<Task>> {
        self.get_json("/api/v1/queue").await
    }

    /// `Ok(None)` when the issue has no running unit.
    pub async fn logs(&self, id: IssueNumber) -> Result<Option<String>> {
        let resp = self
            .send(self.http.get(self.url(&format!("/api/v1/tasks/{}/logs", id.0))))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp).await?;
        Ok(Some(resp.text().await?))
    }

    pub async fn control(&self, action: &str) -> Result<ControlResponse> {
        let resp = self
            .send(self.http.post(self.url(&format!("/api/v1/{action}"))))
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(self.http.get(self.url(path))).await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                anyhow::Error::new(Unreachable(self.base.clone()))
            } else {
                anyhow::Error::new(e)
            }
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    match body.get("error").and_then(|e| e.as_str()) {
        Some(msg) => bail!("daemon returned {status}: {msg}"),
        None => bail!("daemon returned {status}"),
    }
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// True when the error chain says the daemon could not be contacted.
pub fn is_unreachable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Unreachable>().is_some()
}
