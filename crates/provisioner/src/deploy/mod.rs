//! Deployment manager: per-host OS and driver installation over the agent.
//!
//! The manager owns one [`HostHandle`] per target host. Each install runs a
//! [`Pipeline`](crate::pipeline::Pipeline) whose executors share a
//! [`StepContext`] that references (never copies) the host handle and the
//! run-wide configuration.

pub mod env_install;
pub mod manager;
pub mod netplan;
pub mod os_install;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::agent::{AgentApi, AgentError, CommandOutput, HostInfo, PollSettings};
use crate::error::{Classify, ErrorKind};
use crate::model::{HostTarget, SharedConfig, SystemMeta};
use crate::pipeline::PipelineError;
use crate::ssh::quote;

pub use env_install::{EnvStep, InstallerKind};
pub use manager::{DeploymentManager, WaitOptions};
pub use os_install::OsStep;

/// Errors raised by the deployment manager and its step executors.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Controller call failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Pipeline failed or could not be resolved.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A step script exited non-zero.
    #[error("Command failed on host {host} with exit code {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    /// The agent reported a failed file transfer.
    #[error("File transfer to {path} failed on host {host}: {message}")]
    TransferFailed {
        host: String,
        path: String,
        message: String,
    },

    /// The controller returned no URL for a published file.
    #[error("No URL for {path} reachable from host {host}")]
    NoUrl { host: String, path: String },

    /// A configured driver package does not exist locally.
    #[error("Package file not found: {}", .0.display())]
    PackageMissing(PathBuf),

    /// A driver package has no known installer.
    #[error("Unsupported package type for {name}: {}", path.display())]
    UnsupportedPackage { name: String, path: PathBuf },

    /// The controller has no system info for the host.
    #[error("No host info available for {0}")]
    MissingHostInfo(String),

    /// Host index does not exist.
    #[error("Host index {index} out of range ({len} hosts)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Readiness wait ran out.
    #[error("Host {host} not ready after {secs}s")]
    Timeout { host: String, secs: u64 },

    /// Netplan rendering failed.
    #[error("Failed to render netplan: {0}")]
    Netplan(#[from] serde_yaml::Error),
}

impl Classify for DeployError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Agent(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
            Self::CommandFailed { .. } | Self::TransferFailed { .. } => ErrorKind::Execution,
            Self::NoUrl { .. } | Self::MissingHostInfo(_) => ErrorKind::Protocol,
            Self::PackageMissing(_) | Self::UnsupportedPackage { .. } => ErrorKind::Resource,
            Self::IndexOutOfRange { .. } | Self::Netplan(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Timeouts, intervals and remote paths used by the install steps.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Poll cadence for script execution.
    pub command_poll: PollSettings,
    /// Poll cadence for large file downloads.
    pub transfer_poll: PollSettings,
    /// Mount point of the new root filesystem.
    pub target_root: String,
    /// Scratch directory on the host.
    pub work_dir: String,
    /// Name the OS image is published under.
    pub image_publish_name: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            command_poll: PollSettings {
                interval: Duration::from_secs(2),
                timeout: Some(Duration::from_secs(30 * 60)),
            },
            transfer_poll: PollSettings {
                interval: Duration::from_secs(5),
                timeout: Some(Duration::from_secs(2 * 60 * 60)),
            },
            target_root: "/mnt/target".to_string(),
            work_dir: "/var/tmp/provision".to_string(),
            image_publish_name: "rootfs".to_string(),
        }
    }
}

/// Per-host state. The target is fixed for the run; info and the pre-reboot
/// session are written by this host's pipeline and readiness wait.
#[derive(Debug)]
pub struct HostHandle {
    target: HostTarget,
    info: RwLock<Option<HostInfo>>,
    image_url: String,
    pre_reboot_session: RwLock<Option<String>>,
}

impl HostHandle {
    /// Create a handle for `target` with its resolved image URL.
    #[must_use]
    pub fn new(target: HostTarget, image_url: String) -> Self {
        Self {
            target,
            info: RwLock::new(None),
            image_url,
            pre_reboot_session: RwLock::new(None),
        }
    }

    /// Snapshot of the target description.
    #[must_use]
    pub fn target(&self) -> HostTarget {
        self.target.clone()
    }

    /// Controller key of the host.
    #[must_use]
    pub fn host_id(&self) -> String {
        self.target.host_id.clone()
    }

    /// URL through which this host downloads the OS image.
    #[must_use]
    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    /// Last host info fetched.
    #[must_use]
    pub fn cached_info(&self) -> Option<HostInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the cached host info.
    pub fn set_info(&self, info: HostInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    /// Session id captured just before the reboot.
    #[must_use]
    pub fn pre_reboot_session(&self) -> Option<String> {
        self.pre_reboot_session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the session id seen before rebooting.
    pub fn set_pre_reboot_session(&self, session_id: &str) {
        *self
            .pre_reboot_session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
    }
}

/// Everything a step executor sees.
#[derive(Clone)]
pub struct StepContext {
    /// This host.
    pub host: Arc<HostHandle>,
    /// Account and network.
    pub shared: Arc<SharedConfig>,
    /// OS base and packages.
    pub system: Arc<SystemMeta>,
    /// Controller client.
    pub agent: Arc<dyn AgentApi>,
    /// Step settings.
    pub settings: Arc<DeploySettings>,
}

impl StepContext {
    /// Run a script on the host; a non-zero exit is an error.
    ///
    /// # Errors
    /// Returns [`DeployError::CommandFailed`] on a non-zero exit, or the agent error.
    pub async fn run_script(&self, script: &str) -> Result<CommandOutput, DeployError> {
        let host = self.host.host_id();
        let command = format!("sh -c {}", quote(script));
        debug!(host = %host, script = %script, "Running step script");

        let output = self
            .agent
            .run_command(&host, &command, self.settings.command_poll)
            .await?;
        if !output.success() {
            return Err(DeployError::CommandFailed {
                host,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Have the host download `url` into `remote_path`.
    ///
    /// # Errors
    /// Returns [`DeployError::TransferFailed`] when the agent reports failure.
    pub async fn download(&self, url: &str, remote_path: &str) -> Result<(), DeployError> {
        let host = self.host.host_id();
        let result = self
            .agent
            .transfer_file(
                &host,
                remote_path,
                url,
                crate::agent::FileOp::Download,
                self.settings.transfer_poll,
            )
            .await?;
        if !result.success {
            return Err(DeployError::TransferFailed {
                host,
                path: remote_path.to_string(),
                message: result.message.unwrap_or_else(|| "unknown error".into()),
            });
        }
        Ok(())
    }

    /// Cached host info, fetched once if absent.
    ///
    /// # Errors
    /// Returns [`DeployError::MissingHostInfo`] if the controller has none.
    pub async fn host_info(&self) -> Result<HostInfo, DeployError> {
        if let Some(info) = self.host.cached_info() {
            return Ok(info);
        }
        let host = self.host.host_id();
        let info = self
            .agent
            .get_host_info(&host)
            .await?
            .ok_or(DeployError::MissingHostInfo(host))?;
        self.host.set_info(info.clone());
        Ok(info)
    }
}
