//! Controller wire models.
//!
//! Every response is an `{ok, ..., reason}` envelope; `reason` is set when
//! `ok` is false.

use serde::{Deserialize, Serialize};

use super::traits::{
    AgentError, CommandOutput, DirEntry, FileOp, FileOperationResult, HostInfo, TaskPayload,
};

// ============================================================================
// Requests
// ============================================================================

/// `POST exec` body.
#[derive(Debug, Serialize)]
pub struct ExecRequest<'a> {
    /// Target host id.
    pub host: &'a str,
    /// Shell command.
    pub cmd: &'a str,
}

/// `POST file` body.
#[derive(Debug, Serialize)]
pub struct FileRequest<'a> {
    /// Target host id.
    pub host: &'a str,
    /// Path on the host.
    pub path: &'a str,
    /// Source or destination URL.
    pub url: &'a str,
    /// Transfer direction.
    pub op: FileOp,
}

/// `POST file-map` body.
#[derive(Debug, Serialize)]
pub struct FileMapRequest<'a> {
    /// Controller-local path.
    pub path: &'a str,
    /// Name to publish under.
    pub publish_name: &'a str,
}

// ============================================================================
// Responses
// ============================================================================

/// Response to submit calls (`exec`, `file`).
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub ok: bool,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response to `GET result`.
#[derive(Debug, Deserialize)]
pub struct ResultResponse {
    pub ok: bool,
    #[serde(default)]
    pub payload: Option<WirePayload>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Task payload, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WirePayload {
    CommandExecutionResponse {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        exit_code: i32,
    },
    FileOperationResponse {
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    None,
}

impl From<WirePayload> for TaskPayload {
    fn from(payload: WirePayload) -> Self {
        match payload {
            WirePayload::CommandExecutionResponse {
                stdout,
                stderr,
                exit_code,
            } => Self::CommandExecution(CommandOutput {
                stdout,
                stderr,
                exit_code,
            }),
            WirePayload::FileOperationResponse { success, message } => {
                Self::FileOperation(FileOperationResult { success, message })
            }
            WirePayload::None => Self::None,
        }
    }
}

/// Response to `GET info`.
#[derive(Debug, Deserialize)]
pub struct InfoResponse {
    pub ok: bool,
    #[serde(default)]
    pub info: Option<HostInfo>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response to `POST file-map`.
#[derive(Debug, Deserialize)]
pub struct FileMapResponse {
    pub ok: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response to `GET url-sub/by-host`.
#[derive(Debug, Deserialize)]
pub struct UrlSubResponse {
    pub ok: bool,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response to `GET fs/lsdir`.
#[derive(Debug, Deserialize)]
pub struct LsDirResponse {
    pub ok: bool,
    #[serde(default)]
    pub entries: Vec<DirEntry>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response to `GET fs/read`.
#[derive(Debug, Deserialize)]
pub struct ReadResponse {
    pub ok: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================================================
// Rejections
// ============================================================================

/// Known rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SessionNotFound,
    TaskNotFound,
    TaskNotCompleted,
    InternalError,
}

impl RejectReason {
    /// Parse a wire reason code.
    #[must_use]
    pub fn parse(reason: &str) -> Option<Self> {
        match reason {
            "SESSION_NOT_FOUND" => Some(Self::SessionNotFound),
            "TASK_NOT_FOUND" => Some(Self::TaskNotFound),
            "TASK_NOT_COMPLETED" => Some(Self::TaskNotCompleted),
            "INTERNAL_ERROR" => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// Map a rejection to an error. `TASK_NOT_COMPLETED` is not an error and is
/// handled by the caller before reaching here.
pub fn rejection(reason: Option<String>, host: &str, task_id: Option<&str>) -> AgentError {
    let reason = reason.unwrap_or_else(|| "unspecified".to_string());
    match RejectReason::parse(&reason) {
        Some(RejectReason::SessionNotFound) => AgentError::SessionNotFound(host.to_string()),
        Some(RejectReason::TaskNotFound) => AgentError::TaskNotFound {
            host: host.to_string(),
            task_id: task_id.unwrap_or_default().to_string(),
        },
        Some(RejectReason::InternalError) => AgentError::Internal(reason),
        Some(RejectReason::TaskNotCompleted) | None => AgentError::Rejected(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let json = r#"{"ok":true,"payload":{"type":"CommandExecutionResponse","stdout":"hi","stderr":"","exit_code":3}}"#;
        let resp: ResultResponse = serde_json::from_str(json).unwrap();
        let payload: TaskPayload = resp.payload.unwrap().into();
        match payload {
            TaskPayload::CommandExecution(out) => {
                assert_eq!(out.stdout, "hi");
                assert_eq!(out.exit_code, 3);
                assert!(!out.success());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let none: ResultResponse =
            serde_json::from_str(r#"{"ok":true,"payload":{"type":"None"}}"#).unwrap();
        assert_eq!(TaskPayload::from(none.payload.unwrap()), TaskPayload::None);
    }

    #[test]
    fn test_rejection_mapping() {
        assert!(matches!(
            rejection(Some("SESSION_NOT_FOUND".into()), "h1", None),
            AgentError::SessionNotFound(h) if h == "h1"
        ));
        assert!(matches!(
            rejection(Some("TASK_NOT_FOUND".into()), "h1", Some("t9")),
            AgentError::TaskNotFound { task_id, .. } if task_id == "t9"
        ));
        assert!(matches!(
            rejection(None, "h1", None),
            AgentError::Rejected(r) if r == "unspecified"
        ));
    }
}
