use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::collector::StatusReport;
use crate::errors::{AgentError, AgentResult};

/// A command handed down in a poll response.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub id: i64,
    pub command: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Debug, Deserialize)]
pub struct PollResponse {
    pub status: String,
    #[serde(default)]
    pub commands: Vec<CommandEnvelope>,
}

/// Latest deployable agent build, as advertised by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub requirements_url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Running,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Running => "running",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
        }
    }
}

/// Where command outcomes get reported. The executor only ever talks to this
/// trait, which is what lets tests capture reports in memory.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, id: i64, status: ReportStatus, output: &str);
}

/// Source of agent builds. The updater only ever talks to this trait, so
/// tests can serve canned version info and artifact bytes.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch_version(&self) -> AgentResult<VersionInfo>;
    async fn download(&self, path: &str) -> AgentResult<Vec<u8>>;
}

/// HTTP client for every exchange with the controller. All requests carry the
/// shared API key header.
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: &str, api_key: &str) -> AgentResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut key = reqwest::header::HeaderValue::from_str(api_key)
            .map_err(|e| AgentError::ConfigError(format!("invalid api key: {}", e)))?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(20))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Push a status report. The response doubles as the dispatch channel:
    /// it carries every command pending for this host.
    pub async fn push_status(&self, report: &StatusReport) -> AgentResult<PollResponse> {
        let response = self
            .http
            .post(self.url("/api/metrics"))
            .json(report)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::TransportError(format!(
                "server returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    pub async fn fetch_version(&self) -> AgentResult<VersionInfo> {
        let response = self
            .http
            .get(self.url("/api/agent/version"))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::UpdateError(format!(
                "version endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Download an artifact advertised by the version endpoint. Paths are
    /// relative to the controller base URL.
    pub async fn download(&self, path: &str) -> AgentResult<Vec<u8>> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::UpdateError(format!(
                "download of {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl UpdateSource for ServerClient {
    async fn fetch_version(&self) -> AgentResult<VersionInfo> {
        ServerClient::fetch_version(self).await
    }

    async fn download(&self, path: &str) -> AgentResult<Vec<u8>> {
        ServerClient::download(self, path).await
    }
}

#[async_trait]
impl ReportSink for ServerClient {
    /// Fire-and-forget: a result that cannot reach the controller is logged
    /// and dropped. There is no local retry buffer.
    async fn report(&self, id: i64, status: ReportStatus, output: &str) {
        let result = self
            .http
            .post(self.url(&format!("/api/commands/{}/result", id)))
            .json(&serde_json::json!({ "status": status, "output": output }))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Reported {} for command {}", status.as_str(), id);
            }
            Ok(response) => {
                error!(
                    "Failed to report result for command {}: server returned {}",
                    id,
                    response.status()
                );
            }
            Err(e) => {
                error!("Failed to report result for command {}: {}", id, e);
            }
        }
    }
}
