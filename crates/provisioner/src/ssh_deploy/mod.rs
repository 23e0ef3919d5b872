//! Deployment over plain SSH, for hosts without an out-of-band agent.
//!
//! There is no resumable pipeline here: each operation is one idempotent
//! privileged command selected by the host's package manager.

pub mod deployer;
pub mod package_manager;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::ssh::SshError;

pub use deployer::SshDeployer;
pub use package_manager::PackageManager;

/// Errors raised by the SSH-only deployer.
#[derive(Error, Debug)]
pub enum SshDeployError {
    /// Underlying SSH failure, including non-zero exits.
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// No template set for the detected package manager.
    #[error("Unsupported package manager: {0}")]
    UnsupportedPackageManager(String),

    /// The host has not been fingerprinted yet.
    #[error("Host must be fingerprinted before deploying")]
    NotFingerprinted,
}

impl Classify for SshDeployError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Ssh(e) => e.kind(),
            Self::UnsupportedPackageManager(_) => ErrorKind::Resource,
            Self::NotFingerprinted => ErrorKind::Validation,
        }
    }
}
