//! Error classification shared by every module.
//!
//! Each module owns its own `thiserror` enum; this module only defines the
//! coarse taxonomy callers use to decide between retrying, fixing config and
//! resuming from a step.

use serde::{Deserialize, Serialize};

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session unreachable, port-forward failure, transport errors.
    Connectivity,
    /// Sudo required without a password, wrong password, no sudo rights.
    Authorization,
    /// Session/task not found, unexpected payload type, malformed replies.
    Protocol,
    /// A remote command exited non-zero.
    Execution,
    /// Missing agent binary, unsupported package manager, missing package file.
    Resource,
    /// Bad ratios, unknown step names, invalid progress tables.
    Validation,
    /// A bounded wait ran out.
    Timeout,
}

impl ErrorKind {
    /// Whether retrying the same call unchanged can reasonably succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connectivity | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Authorization => write!(f, "authorization"),
            Self::Protocol => write!(f, "protocol"),
            Self::Execution => write!(f, "execution"),
            Self::Resource => write!(f, "resource"),
            Self::Validation => write!(f, "validation"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Implemented by every module error so callers can classify without
/// matching on each enum.
pub trait Classify {
    /// The taxonomy bucket this error falls into.
    fn kind(&self) -> ErrorKind;
}

/// Best-effort classification of an `anyhow` chain produced by a step executor.
///
/// Walks the chain and returns the first classified error found; anything
/// unrecognized counts as an execution failure.
#[must_use]
pub fn classify_anyhow(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<crate::agent::AgentError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::ssh::SshError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::deploy::DeployError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::download::DownloadError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::ssh_deploy::SshDeployError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::pipeline::PipelineError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::model::ConfigError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<crate::progress::ProgressError>() {
            return e.kind();
        }
    }
    ErrorKind::Execution
}
