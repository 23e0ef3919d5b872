//! Minimal aria2 JSON-RPC client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::DownloadError;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Fields requested from `aria2.tellStatus`.
const STATUS_KEYS: [&str; 7] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "followedBy",
    "errorCode",
    "errorMessage",
];

/// aria2 task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl TaskState {
    /// Whether the task will not change any more.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Error | Self::Complete | Self::Removed)
    }
}

/// Reply of `aria2.tellStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub gid: String,
    pub status: TaskState,
    #[serde(default, deserialize_with = "u64_from_str")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "u64_from_str")]
    pub completed_length: u64,
    /// Subtasks created from this one, e.g. by metalink expansion.
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// aria2 encodes integers as strings.
fn u64_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

/// JSON-RPC client for one aria2 daemon.
pub struct Aria2Client {
    client: Client,
    url: Url,
    secret: Option<String>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Aria2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aria2Client")
            .field("url", &self.url.as_str())
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl Aria2Client {
    /// Create a client for the RPC endpoint (usually `http://host:6800/jsonrpc`).
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the HTTP client cannot be built.
    pub fn new(rpc_url: &str, secret: Option<String>) -> Result<Self, DownloadError> {
        let url = Url::parse(rpc_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url,
            secret,
            next_id: AtomicU64::new(1),
        })
    }

    /// Parameters with the secret token prepended when one is set.
    fn params(&self, params: Vec<Value>) -> Vec<Value> {
        match &self.secret {
            Some(secret) => std::iter::once(json!(format!("token:{secret}")))
                .chain(params)
                .collect(),
            None => params,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, DownloadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": self.params(params),
        });
        debug!(method = %method, id, "aria2 RPC call");

        let response = self.client.post(self.url.clone()).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        let reply: RpcResponse = serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, status = %status, body = %text, "Failed to parse aria2 response");
            DownloadError::UnexpectedResponse(format!("HTTP {status}: {text}"))
        })?;

        if let Some(fault) = reply.error {
            return Err(DownloadError::Rpc {
                code: fault.code,
                message: fault.message,
            });
        }
        let result = reply
            .result
            .ok_or_else(|| DownloadError::UnexpectedResponse(format!("{method}: no result")))?;
        serde_json::from_value(result)
            .map_err(|e| DownloadError::UnexpectedResponse(format!("{method}: {e}")))
    }

    /// Queue `uri` with metalink following enabled; returns the task gid.
    ///
    /// # Errors
    /// Returns error if the call fails.
    pub async fn add_uri(&self, uri: &str, dir: Option<&str>) -> Result<String, DownloadError> {
        let mut options = json!({ "follow-metalink": "true" });
        if let Some(dir) = dir {
            options["dir"] = json!(dir);
        }
        self.call("aria2.addUri", vec![json!([uri]), options]).await
    }

    /// Status of one task.
    ///
    /// # Errors
    /// Returns error if the call fails or the gid is unknown.
    pub async fn tell_status(&self, gid: &str) -> Result<TaskStatus, DownloadError> {
        self.call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await
    }

    /// Status of many tasks in one round trip. Per-task faults are returned
    /// in place rather than failing the batch.
    ///
    /// # Errors
    /// Returns error if the batch call itself fails.
    pub async fn multicall(
        &self,
        gids: &[String],
    ) -> Result<Vec<Result<TaskStatus, DownloadError>>, DownloadError> {
        let calls: Vec<Value> = gids
            .iter()
            .map(|gid| {
                json!({
                    "methodName": "aria2.tellStatus",
                    "params": self.params(vec![json!(gid), json!(STATUS_KEYS)]),
                })
            })
            .collect();

        // The secret goes into each inner call, not the outer one.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": "system.multicall",
            "params": [calls],
        });
        debug!(tasks = gids.len(), "aria2 multicall");

        let response = self.client.post(self.url.clone()).json(&body).send().await?;
        let text = response.text().await?;
        let reply: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| DownloadError::UnexpectedResponse(format!("system.multicall: {e}")))?;
        if let Some(fault) = reply.error {
            return Err(DownloadError::Rpc {
                code: fault.code,
                message: fault.message,
            });
        }
        let entries: Vec<Value> = reply
            .result
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| DownloadError::UnexpectedResponse("system.multicall: no result".into()))?;
        if entries.len() != gids.len() {
            return Err(DownloadError::UnexpectedResponse(format!(
                "system.multicall: {} results for {} calls",
                entries.len(),
                gids.len()
            )));
        }

        Ok(entries.into_iter().map(multicall_entry).collect())
    }

    /// Remove a task without waiting for its connections to close.
    ///
    /// # Errors
    /// Returns error if the call fails.
    pub async fn force_remove(&self, gid: &str) -> Result<String, DownloadError> {
        self.call("aria2.forceRemove", vec![json!(gid)]).await
    }
}

/// A multicall entry is either `[result]` or a fault struct.
fn multicall_entry(entry: Value) -> Result<TaskStatus, DownloadError> {
    match entry {
        Value::Array(mut values) if values.len() == 1 => serde_json::from_value(values.remove(0))
            .map_err(|e| DownloadError::UnexpectedResponse(format!("tellStatus: {e}"))),
        other => match serde_json::from_value::<RpcFault>(other) {
            Ok(fault) => Err(DownloadError::Rpc {
                code: fault.code,
                message: fault.message,
            }),
            Err(e) => Err(DownloadError::UnexpectedResponse(format!(
                "multicall entry: {e}"
            ))),
        },
    }
}
