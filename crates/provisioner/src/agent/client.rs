//! HTTP client for the agent controller.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use super::models::{
    rejection, ExecRequest, FileMapRequest, FileMapResponse, FileRequest, InfoResponse,
    LsDirResponse, ReadResponse, RejectReason, ResultResponse, SubmitResponse, UrlSubResponse,
};
use super::traits::{
    AgentApi, AgentError, DirEntry, FileOp, HostInfo, PublishedFile, TaskId, TaskPayload,
    TaskPoll,
};

/// Default timeout for a single API request.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Stateless client for one controller.
#[derive(Clone)]
pub struct AgentClient {
    /// HTTP client.
    client: Client,
    /// Controller base URL, without trailing slash.
    base_url: String,
}

impl AgentClient {
    /// Create a client for the controller at `base_url`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let parsed = Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Controller base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Make a GET request with query parameters.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AgentError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self.client.get(&url).query(query).send().await?;
        Self::handle_response(response).await
    }

    /// Make a JSON POST request.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, AgentError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self.client.post(&url).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// Parse a JSON body or turn a non-success status into an error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                AgentError::Serialization(e)
            })
        } else {
            Err(AgentError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    fn submitted(resp: SubmitResponse, host: &str) -> Result<TaskId, AgentError> {
        match (resp.ok, resp.task_id) {
            (true, Some(task_id)) => Ok(TaskId(task_id)),
            (true, None) => Err(AgentError::Rejected("accepted without a task id".into())),
            (false, _) => Err(rejection(resp.reason, host, None)),
        }
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn execute(&self, host: &str, command: &str) -> Result<TaskId, AgentError> {
        debug!(host = %host, command = %command, "Submitting command");
        let resp: SubmitResponse = self
            .post("exec", &ExecRequest { host, cmd: command })
            .await?;
        Self::submitted(resp, host)
    }

    async fn poll_result(&self, host: &str, task: &TaskId) -> Result<TaskPoll, AgentError> {
        let resp: ResultResponse = self
            .get("result", &[("host", host), ("task_id", task.0.as_str())])
            .await?;

        if resp.ok {
            let payload = resp.payload.map_or(TaskPayload::None, TaskPayload::from);
            return Ok(TaskPoll::Done(payload));
        }

        if resp.reason.as_deref().and_then(RejectReason::parse)
            == Some(RejectReason::TaskNotCompleted)
        {
            return Ok(TaskPoll::Pending);
        }

        Err(rejection(resp.reason, host, Some(&task.0)))
    }

    async fn file_operation(
        &self,
        host: &str,
        remote_path: &str,
        url: &str,
        op: FileOp,
    ) -> Result<TaskId, AgentError> {
        debug!(host = %host, path = %remote_path, url = %url, op = ?op, "Submitting file operation");
        let resp: SubmitResponse = self
            .post(
                "file",
                &FileRequest {
                    host,
                    path: remote_path,
                    url,
                    op,
                },
            )
            .await?;
        Self::submitted(resp, host)
    }

    async fn get_host_info(&self, host: &str) -> Result<Option<HostInfo>, AgentError> {
        let resp: InfoResponse = self.get("info", &[("host", host)]).await?;
        if resp.ok {
            Ok(resp.info)
        } else {
            Err(rejection(resp.reason, host, None))
        }
    }

    async fn publish_file(
        &self,
        local_path: &Path,
        name: &str,
    ) -> Result<PublishedFile, AgentError> {
        let path = local_path.to_string_lossy();
        debug!(path = %path, name = %name, "Publishing file");
        let resp: FileMapResponse = self
            .post(
                "file-map",
                &FileMapRequest {
                    path: &path,
                    publish_name: name,
                },
            )
            .await?;

        if !resp.ok {
            return Err(AgentError::Rejected(
                resp.reason.unwrap_or_else(|| format!("publish of {path} refused")),
            ));
        }
        Ok(PublishedFile {
            path: resp.path.unwrap_or_else(|| name.to_string()),
        })
    }

    async fn resolve_url_for_host(
        &self,
        path: &str,
        host: &str,
    ) -> Result<Vec<String>, AgentError> {
        let resp: UrlSubResponse = self
            .get("url-sub/by-host", &[("host", host), ("path", path)])
            .await?;
        if resp.ok {
            Ok(resp.urls)
        } else {
            Err(rejection(resp.reason, host, None))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, AgentError> {
        let resp: LsDirResponse = self.get("fs/lsdir", &[("path", path)]).await?;
        if resp.ok {
            Ok(resp.entries)
        } else {
            Err(AgentError::Rejected(
                resp.reason.unwrap_or_else(|| format!("cannot list {path}")),
            ))
        }
    }

    async fn read_file(&self, path: &str, max_size: u64) -> Result<String, AgentError> {
        let max = max_size.to_string();
        let resp: ReadResponse = self
            .get("fs/read", &[("path", path), ("max_size", max.as_str())])
            .await?;
        match (resp.ok, resp.content) {
            (true, Some(content)) => Ok(content),
            (true, None) => Ok(String::new()),
            (false, _) => Err(AgentError::Rejected(
                resp.reason.unwrap_or_else(|| format!("cannot read {path}")),
            )),
        }
    }
}
