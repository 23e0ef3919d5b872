//! SSH bootstrap of the remote agent.
//!
//! One remote shell session per host is used to escalate privilege,
//! fingerprint the system, upload the matching agent binary and launch it
//! with a port forward back to the controller.

pub mod bootstrap;
pub mod output;
pub mod platform;
pub mod shell;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

pub use bootstrap::{AbortHandle, BootstrapSettings, BootstrapState, SshBootstrap, SudoMode};
pub use output::{scan_agent_output, AgentOutputParser, AgentOutputScan, DEFAULT_READY_MARKER};
pub use platform::{select_agent_binary, Arch, Fingerprint, OsFamily};
pub use shell::{PortForward, PtyProcess, RemoteShell, ShellOutput, Ssh2Shell};

/// Errors raised by the SSH bootstrap path.
#[derive(Error, Debug)]
pub enum SshError {
    /// TCP connection to the SSH port failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// libssh2 reported an error.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Local or channel I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Login was refused.
    #[error("SSH authentication failed for user {0}")]
    AuthenticationFailed(String),

    /// Passwordless sudo is unavailable and no password is configured.
    #[error("sudo requires a password but none is configured")]
    SudoPasswordRequired,

    /// sudo rejected the configured password.
    #[error("sudo password is incorrect")]
    SudoPasswordIncorrect,

    /// The user cannot use sudo at all.
    #[error("user has no sudo rights: {0}")]
    NoSudoRights(String),

    /// `uname -s` reported an OS we have no agent build for.
    #[error("Unsupported operating system: {0}")]
    UnsupportedOs(String),

    /// `uname -m` reported an architecture we have no agent build for.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    /// No staged agent binary matches the detected platform.
    #[error("No agent binary for {os}/{arch} in {}", dir.display())]
    AgentBinaryNotFound {
        os: String,
        arch: String,
        dir: PathBuf,
    },

    /// Remote port forwarding could not be established.
    #[error("Port forward failed: {0}")]
    PortForward(String),

    /// Agent exited before printing the readiness marker.
    #[error("Agent exited before becoming ready; last output: {0}")]
    AgentExited(String),

    /// Agent became ready without announcing a host id.
    #[error("Agent became ready without reporting a host id")]
    AgentIdentityMissing,

    /// Readiness marker not seen in time.
    #[error("Agent not ready after {0}s")]
    ReadinessTimeout(u64),

    /// Operation called out of order.
    #[error("Invalid bootstrap state: expected {expected:?}, currently {actual:?}")]
    InvalidState {
        expected: BootstrapState,
        actual: BootstrapState,
    },

    /// A remote command exited non-zero.
    #[error("Command `{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A blocking SSH worker panicked or was cancelled.
    #[error("SSH worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl Classify for SshError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::Ssh(_) | Self::Io(_) | Self::PortForward(_) => {
                ErrorKind::Connectivity
            }
            Self::AuthenticationFailed(_)
            | Self::SudoPasswordRequired
            | Self::SudoPasswordIncorrect
            | Self::NoSudoRights(_) => ErrorKind::Authorization,
            Self::UnsupportedOs(_) | Self::UnsupportedArch(_) | Self::AgentBinaryNotFound { .. } => {
                ErrorKind::Resource
            }
            Self::AgentExited(_) | Self::CommandFailed { .. } | Self::Worker(_) => {
                ErrorKind::Execution
            }
            Self::AgentIdentityMissing => ErrorKind::Protocol,
            Self::ReadinessTimeout(_) => ErrorKind::Timeout,
            Self::InvalidState { .. } => ErrorKind::Validation,
        }
    }
}

/// Quote a string for POSIX `sh`.
#[must_use]
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
