//! Metalink downloads delegated to an aria2 daemon.
//!
//! A metalink is submitted as one meta task; once aria2 has expanded it, the
//! real subtasks are polled as a batch until every one has settled.

pub mod aria2;
pub mod coordinator;

use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

pub use aria2::{Aria2Client, TaskState, TaskStatus};
pub use coordinator::{DownloadState, DownloadTask, MetalinkDownload};

/// Errors from the download daemon or the download workflow.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// RPC endpoint URL is invalid.
    #[error("Invalid RPC URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// aria2 returned a JSON-RPC error.
    #[error("aria2 error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Reply did not match the expected shape.
    #[error("Unexpected aria2 response: {0}")]
    UnexpectedResponse(String),

    /// The metalink itself could not be fetched or expanded.
    #[error("Metalink task {gid} failed: {message}")]
    MetalinkFailed { gid: String, message: String },
}

impl Classify for DownloadError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) => ErrorKind::Connectivity,
            Self::InvalidUrl(_) => ErrorKind::Validation,
            Self::Rpc { .. } | Self::UnexpectedResponse(_) => ErrorKind::Protocol,
            Self::MetalinkFailed { .. } => ErrorKind::Execution,
        }
    }
}

/// Aggregate state after one polling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Byte-weighted completion, 0-100.
    pub percent: f64,
    pub completed_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub total_count: usize,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// Whether the metalink has been expanded into its subtasks.
    pub expanded: bool,
}

impl DownloadProgress {
    /// Whether the subtask set is known and every subtask has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.expanded && self.pending_count == 0
    }
}

/// A subtask that ended in error or was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub gid: String,
    pub message: String,
}

/// Outcome of a finished or cancelled download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadReport {
    /// No subtask failed and the run was not cancelled.
    pub success: bool,
    /// The progress callback asked to stop.
    pub cancelled: bool,
    /// Completed subtask ids.
    pub completed: Vec<String>,
    /// Failed subtasks.
    pub failed: Vec<FailedTask>,
    /// Last aggregate.
    pub progress: DownloadProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpanded_download_is_not_settled() {
        assert!(!DownloadProgress::default().is_settled());

        let empty = DownloadProgress {
            percent: 100.0,
            expanded: true,
            ..DownloadProgress::default()
        };
        assert!(empty.is_settled());

        let busy = DownloadProgress {
            pending_count: 1,
            total_count: 1,
            expanded: true,
            ..DownloadProgress::default()
        };
        assert!(!busy.is_settled());
    }
}
