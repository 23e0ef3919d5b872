//! Run file loading and CLI/env overrides.
//!
//! The run file is the library's [`RunSpec`] plus a few CLI-only settings:
//! the controller URL, the aria2 endpoint and poll cadence. Flags and
//! environment variables win over the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tracing::debug;

use provisioner::agent::{AgentApi, AgentClient, PollSettings};
use provisioner::deploy::{DeploySettings, DeploymentManager};
use provisioner::model::RunSpec;

/// aria2 settings in the run file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2Section {
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Poll cadence overrides in milliseconds. A timeout of zero or less waits forever.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollingSection {
    #[serde(default)]
    pub command_interval_ms: Option<u64>,
    #[serde(default)]
    pub command_timeout_ms: Option<i64>,
    #[serde(default)]
    pub transfer_interval_ms: Option<u64>,
    #[serde(default)]
    pub transfer_timeout_ms: Option<i64>,
}

fn poll_override(
    base: PollSettings,
    interval_ms: Option<u64>,
    timeout_ms: Option<i64>,
) -> PollSettings {
    if interval_ms.is_none() && timeout_ms.is_none() {
        return base;
    }
    let interval_ms = interval_ms
        .or_else(|| u64::try_from(base.interval.as_millis()).ok())
        .unwrap_or(2000);
    let timeout_ms = timeout_ms
        .or_else(|| base.timeout.and_then(|t| i64::try_from(t.as_millis()).ok()))
        .unwrap_or(0);
    PollSettings::from_millis(interval_ms, timeout_ms)
}

impl PollingSection {
    /// Deployment settings with these overrides applied.
    pub fn deploy_settings(&self) -> DeploySettings {
        let defaults = DeploySettings::default();
        DeploySettings {
            command_poll: poll_override(
                defaults.command_poll,
                self.command_interval_ms,
                self.command_timeout_ms,
            ),
            transfer_poll: poll_override(
                defaults.transfer_poll,
                self.transfer_interval_ms,
                self.transfer_timeout_ms,
            ),
            ..defaults
        }
    }
}

/// On-disk run file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunFile {
    /// Controller API base URL.
    #[serde(default)]
    pub controller_url: Option<String>,
    /// Download daemon.
    #[serde(default)]
    pub aria2: Aria2Section,
    /// Poll cadence for agent tasks.
    #[serde(default)]
    pub polling: PollingSection,
    /// Hosts, account, network, image and packages.
    #[serde(flatten)]
    pub spec: RunSpec,
}

impl RunFile {
    /// Read, parse and validate a run file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid run file {}", path.display()))
    }

    fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(text)?;
        file.spec.validate()?;
        debug!(hosts = file.spec.hosts.len(), "Run file loaded");
        Ok(file)
    }
}

/// Arguments shared by every command that works on a run.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Run file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "PROVISION_CONFIG",
        default_value = "provision.yaml"
    )]
    pub config: PathBuf,

    /// Controller API base URL (overrides the run file).
    #[arg(long, value_name = "URL", env = "PROVISION_CONTROLLER_URL")]
    pub controller_url: Option<String>,
}

/// A loaded run with overrides applied.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub controller_url: String,
    pub spec: RunSpec,
    pub settings: DeploySettings,
}

impl RunArgs {
    /// Load the run file and apply overrides.
    pub fn load(&self) -> Result<RunConfig> {
        let file = RunFile::load(&self.config)?;
        Ok(RunConfig {
            controller_url: resolve_controller_url(self.controller_url.as_deref(), &file)?,
            settings: file.polling.deploy_settings(),
            spec: file.spec,
        })
    }
}

fn resolve_controller_url(flag: Option<&str>, file: &RunFile) -> Result<String> {
    flag.map(str::to_string)
        .or_else(|| file.controller_url.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No controller URL: set controller_url in the run file, \
                 pass --controller-url or set PROVISION_CONTROLLER_URL"
            )
        })
}

impl RunConfig {
    /// Indices of the selected hosts: one by id, or all.
    pub fn select_hosts(&self, host: Option<&str>) -> Result<Vec<usize>> {
        match host {
            None => Ok((0..self.spec.hosts.len()).collect()),
            Some(id) => self
                .spec
                .hosts
                .iter()
                .position(|h| h.host_id == id)
                .map(|i| vec![i])
                .ok_or_else(|| anyhow::anyhow!("Host '{id}' is not in the run file")),
        }
    }

    /// Connect to the controller and build the deployment manager.
    pub async fn manager(&self) -> Result<DeploymentManager> {
        let agent: Arc<dyn AgentApi> = Arc::new(
            AgentClient::new(&self.controller_url).context("Failed to create controller client")?,
        );
        DeploymentManager::new(agent, self.spec.clone(), self.settings.clone())
            .await
            .context("Failed to prepare deployment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RUN_FILE: &str = r"
controller_url: http://10.0.0.2:8080/api
aria2:
  rpc_url: http://10.0.0.2:6800/jsonrpc
hosts:
  - host_id: h1
    disk: /dev/sda
    hostname: node-1
  - host_id: h2
    disk: /dev/sda
    hostname: node-2
    ssh:
      address: 10.0.0.12
      username: ops
os_image_path: /srv/images/rootfs.tar.gz
account:
  username: ops
os_base:
  distro: ubuntu
  version: '24.04'
  arch: arm64
";

    fn config() -> RunConfig {
        let file = RunFile::parse(RUN_FILE).unwrap();
        RunConfig {
            controller_url: resolve_controller_url(None, &file).unwrap(),
            settings: file.polling.deploy_settings(),
            spec: file.spec,
        }
    }

    #[test]
    fn test_run_file_flattens_run_spec() {
        let file = RunFile::parse(RUN_FILE).unwrap();
        assert_eq!(file.spec.hosts.len(), 2);
        assert_eq!(file.spec.hosts[1].ssh.as_ref().unwrap().port, 22);
        assert_eq!(file.aria2.rpc_url.as_deref(), Some("http://10.0.0.2:6800/jsonrpc"));
        assert!(file.aria2.secret.is_none());
    }

    #[test]
    fn test_flag_overrides_file_controller_url() {
        let file = RunFile::parse(RUN_FILE).unwrap();
        assert_eq!(
            resolve_controller_url(Some("http://override/api"), &file).unwrap(),
            "http://override/api"
        );
        assert_eq!(
            resolve_controller_url(None, &file).unwrap(),
            "http://10.0.0.2:8080/api"
        );

        let bare = RunFile::parse(&RUN_FILE.replace("controller_url: http://10.0.0.2:8080/api\n", "")).unwrap();
        assert!(resolve_controller_url(None, &bare).is_err());
    }

    #[test]
    fn test_select_hosts() {
        let config = config();
        assert_eq!(config.select_hosts(None).unwrap(), vec![0, 1]);
        assert_eq!(config.select_hosts(Some("h2")).unwrap(), vec![1]);
        assert!(config.select_hosts(Some("h9")).is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "hosts: []\n").unwrap();
        let err = RunFile::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("run.yaml"));
    }

    #[test]
    fn test_polling_overrides() {
        let defaults = DeploySettings::default();
        let file = RunFile::parse(RUN_FILE).unwrap();
        let untouched = file.polling.deploy_settings();
        assert_eq!(untouched.command_poll.timeout, defaults.command_poll.timeout);

        let text = format!(
            "{RUN_FILE}polling:\n  command_interval_ms: 500\n  transfer_timeout_ms: 0\n"
        );
        let settings = RunFile::parse(&text).unwrap().polling.deploy_settings();
        assert_eq!(settings.command_poll.interval, Duration::from_millis(500));
        assert_eq!(settings.command_poll.timeout, defaults.command_poll.timeout);
        assert_eq!(settings.transfer_poll.interval, defaults.transfer_poll.interval);
        assert_eq!(settings.transfer_poll.timeout, None);
    }
}
