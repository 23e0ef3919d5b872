//! Agent API trait and common types.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Classify, ErrorKind};

/// Errors that can occur talking to the controller.
#[derive(Error, Debug)]
pub enum AgentError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Controller answered with a non-success status.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Controller base URL is malformed.
    #[error("Invalid controller URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// No agent session for this host.
    #[error("Session not found for host {0}")]
    SessionNotFound(String),

    /// The task id is unknown to the controller.
    #[error("Task {task_id} not found on host {host}")]
    TaskNotFound { host: String, task_id: String },

    /// Controller reported an internal failure.
    #[error("Controller internal error: {0}")]
    Internal(String),

    /// Controller rejected the request for a reason we do not model.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The task completed with a different payload than the caller expected.
    #[error("Unexpected task payload: expected {expected}, got {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: &'static str,
    },

    /// Response body did not parse.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task did not complete in time.
    #[error("Task {task_id} on host {host} did not complete within {secs}s")]
    Timeout {
        host: String,
        task_id: String,
        secs: u64,
    },

    /// Host never showed up on the controller.
    #[error("Host {host} not discovered after {attempts} attempts")]
    HostNotDiscovered { host: String, attempts: u32 },
}

impl Classify for AgentError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) => ErrorKind::Connectivity,
            Self::InvalidUrl(_) => ErrorKind::Validation,
            Self::Timeout { .. } | Self::HostNotDiscovered { .. } => ErrorKind::Timeout,
            Self::Api { .. }
            | Self::SessionNotFound(_)
            | Self::TaskNotFound { .. }
            | Self::Internal(_)
            | Self::Rejected(_)
            | Self::UnexpectedPayload { .. }
            | Self::Serialization(_) => ErrorKind::Protocol,
        }
    }
}

/// Identifier of a task submitted to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one poll. "Not completed yet" is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    /// Task finished with this payload.
    Done(TaskPayload),
    /// Task still running.
    Pending,
}

/// Result payload of a completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Result of a shell command.
    CommandExecution(CommandOutput),
    /// Result of an upload/download.
    FileOperation(FileOperationResult),
    /// Task produced no payload.
    None,
}

impl TaskPayload {
    /// Payload type name as used on the wire.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CommandExecution(_) => "CommandExecutionResponse",
            Self::FileOperation(_) => "FileOperationResponse",
            Self::None => "None",
        }
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Standard output.
    #[serde(default)]
    pub stdout: String,
    /// Standard error.
    #[serde(default)]
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of a file transfer task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileOperationResult {
    /// Whether the transfer succeeded.
    pub success: bool,
    /// Agent-side message, usually set on failure.
    #[serde(default)]
    pub message: Option<String>,
}

/// Direction of a file transfer, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    /// Host pushes a local file to a URL.
    Upload,
    /// Host fetches a URL into a local file.
    Download,
}

/// Network interface reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NicInfo {
    /// Interface name (`eno1`).
    pub name: String,
    /// MAC address.
    #[serde(default)]
    pub mac: String,
    /// Addresses in CIDR notation.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl NicInfo {
    /// Loopback and virtual devices report an all-zero MAC.
    #[must_use]
    pub fn has_hardware_mac(&self) -> bool {
        !self.mac.is_empty() && self.mac.chars().any(|c| c.is_ascii_hexdigit() && c != '0')
    }
}

/// Disk reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Device name (`nvme0n1`).
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size_bytes: u64,
    /// Model string.
    #[serde(default)]
    pub model: Option<String>,
}

/// Host system description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// OS name (`Linux`).
    #[serde(default)]
    pub os: String,
    /// Architecture as reported (`x86_64`).
    #[serde(default)]
    pub arch: String,
    /// Current hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Network interfaces.
    #[serde(default)]
    pub nics: Vec<NicInfo>,
    /// Block devices.
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
}

/// Host metadata held by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Current agent session id; changes whenever the agent restarts.
    pub session_id: String,
    /// URL the agent used to reach the controller.
    #[serde(default)]
    pub controller_url: Option<String>,
    /// System details.
    #[serde(default)]
    pub system_info: SystemInfo,
    /// Last time the controller heard from the agent.
    #[serde(default)]
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// A local file exposed through the controller's file server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedFile {
    /// Published path, used with [`AgentApi::resolve_url_for_host`].
    pub path: String,
}

/// Entry of a controller-side directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name.
    pub name: String,
    /// Whether the entry is a directory.
    #[serde(default)]
    pub is_dir: bool,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Poll cadence for task completion.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay between polls.
    pub interval: Duration,
    /// Upper bound; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl PollSettings {
    /// Build settings from a millisecond config where `timeout_ms <= 0` means unbounded.
    #[must_use]
    pub fn from_millis(interval_ms: u64, timeout_ms: i64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            timeout: u64::try_from(timeout_ms)
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(3600)),
        }
    }
}

/// Controller API used by the deployment manager.
///
/// Every mutating call is two-phase: submit returns a [`TaskId`], then the
/// caller polls until the task is done.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Submit a shell command.
    async fn execute(&self, host: &str, command: &str) -> Result<TaskId, AgentError>;

    /// Poll a task once.
    async fn poll_result(&self, host: &str, task: &TaskId) -> Result<TaskPoll, AgentError>;

    /// Submit a file transfer between a host path and a URL.
    async fn file_operation(
        &self,
        host: &str,
        remote_path: &str,
        url: &str,
        op: FileOp,
    ) -> Result<TaskId, AgentError>;

    /// Fetch host metadata; `None` when the controller knows the session but has no info yet.
    async fn get_host_info(&self, host: &str) -> Result<Option<HostInfo>, AgentError>;

    /// Expose a controller-local file under `name`.
    async fn publish_file(&self, local_path: &Path, name: &str)
        -> Result<PublishedFile, AgentError>;

    /// URLs through which `host` can reach a published path.
    async fn resolve_url_for_host(&self, path: &str, host: &str)
        -> Result<Vec<String>, AgentError>;

    /// List a controller-side directory.
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, AgentError>;

    /// Read up to `max_size` bytes of a controller-side file.
    async fn read_file(&self, path: &str, max_size: u64) -> Result<String, AgentError>;

    /// Submit an upload of `remote_path` on the host to `url`.
    async fn upload_file(&self, host: &str, remote_path: &str, url: &str) -> Result<TaskId, AgentError> {
        self.file_operation(host, remote_path, url, FileOp::Upload).await
    }

    /// Submit a download of `url` into `remote_path` on the host.
    async fn download_file(&self, host: &str, remote_path: &str, url: &str) -> Result<TaskId, AgentError> {
        self.file_operation(host, remote_path, url, FileOp::Download).await
    }

    /// Poll a task at a fixed interval until it completes.
    ///
    /// A `None` timeout polls without bound; callers must choose that explicitly.
    async fn block_until_complete(
        &self,
        host: &str,
        task: &TaskId,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<TaskPayload, AgentError> {
        let start = Instant::now();

        loop {
            match self.poll_result(host, task).await? {
                TaskPoll::Done(payload) => {
                    debug!(host = %host, task_id = %task, elapsed_ms = start.elapsed().as_millis(), "Task complete");
                    return Ok(payload);
                }
                TaskPoll::Pending => {}
            }

            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(AgentError::Timeout {
                        host: host.to_string(),
                        task_id: task.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Execute a command and wait for its output.
    ///
    /// Exit codes are not interpreted here.
    async fn run_command(
        &self,
        host: &str,
        command: &str,
        poll: PollSettings,
    ) -> Result<CommandOutput, AgentError> {
        let task = self.execute(host, command).await?;
        match self
            .block_until_complete(host, &task, poll.interval, poll.timeout)
            .await?
        {
            TaskPayload::CommandExecution(output) => Ok(output),
            other => Err(AgentError::UnexpectedPayload {
                expected: "CommandExecutionResponse",
                actual: other.type_name(),
            }),
        }
    }

    /// Run a file transfer and wait for its result.
    async fn transfer_file(
        &self,
        host: &str,
        remote_path: &str,
        url: &str,
        op: FileOp,
        poll: PollSettings,
    ) -> Result<FileOperationResult, AgentError> {
        let task = self.file_operation(host, remote_path, url, op).await?;
        match self
            .block_until_complete(host, &task, poll.interval, poll.timeout)
            .await?
        {
            TaskPayload::FileOperation(result) => Ok(result),
            other => Err(AgentError::UnexpectedPayload {
                expected: "FileOperationResponse",
                actual: other.type_name(),
            }),
        }
    }

    /// Bounded discovery scan: poll until the controller reports info for `host`.
    async fn wait_for_host(
        &self,
        host: &str,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<HostInfo, AgentError> {
        info!(host = %host, max_attempts, "Waiting for host to register");

        for attempt in 1..=max_attempts {
            match self.get_host_info(host).await {
                Ok(Some(info)) => {
                    info!(host = %host, attempt, session_id = %info.session_id, "Host registered");
                    return Ok(info);
                }
                Ok(None) | Err(AgentError::SessionNotFound(_)) => {
                    debug!(host = %host, attempt, "Host not registered yet");
                }
                Err(e) => return Err(e),
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(AgentError::HostNotDiscovered {
            host: host.to_string(),
            attempts: max_attempts,
        })
    }
}
