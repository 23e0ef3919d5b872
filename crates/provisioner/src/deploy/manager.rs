use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

use super::env_install::{env_pipeline, publish_packages, PublishedPackage, ENV_STAGE};
use super::os_install::{os_pipeline, OsStep};
use super::{DeployError, DeploySettings, EnvStep, HostHandle, StepContext};
use crate::agent::{AgentApi, AgentError, HostInfo};
use crate::error::Classify;
use crate::model::{HostTarget, RunSpec, SharedConfig, SystemMeta};
use crate::pipeline::{Pipeline, PipelineError, ProgressEvent};

/// Options for [`DeploymentManager::wait_until_ready`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Session id that still counts as "not back yet". Defaults to the one
    /// captured before the reboot, then the cached session, then the host id.
    pub skip_session_id: Option<String>,
    /// Delay between polls.
    pub interval: Duration,
    /// Upper bound on the wait.
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            skip_session_id: None,
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// One provisioning run over a fixed set of hosts.
///
/// Created once per run; every operation takes `&self`, so callers fan out
/// over host indices concurrently.
pub struct DeploymentManager {
    agent: Arc<dyn AgentApi>,
    shared: Arc<SharedConfig>,
    system: Arc<SystemMeta>,
    settings: Arc<DeploySettings>,
    hosts: Vec<Arc<HostHandle>>,
    os_pipeline: Pipeline<OsStep, StepContext>,
    packages: OnceCell<Vec<PublishedPackage>>,
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("hosts", &self.hosts)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DeploymentManager {
    /// Publish the OS image and resolve a download URL for every host.
    ///
    /// # Errors
    ///
    /// Fails if publishing fails or any host has no URL; no manager is built then.
    pub async fn new(
        agent: Arc<dyn AgentApi>,
        spec: RunSpec,
        settings: DeploySettings,
    ) -> Result<Self, DeployError> {
        let RunSpec {
            hosts,
            os_image_path,
            shared,
            system,
        } = spec;

        let image = agent
            .publish_file(&os_image_path, &settings.image_publish_name)
            .await?;
        info!(image = %os_image_path.display(), path = %image.path, "Published OS image");

        let mut handles = Vec::with_capacity(hosts.len());
        for target in hosts {
            let url = agent
                .resolve_url_for_host(&image.path, &target.host_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DeployError::NoUrl {
                    host: target.host_id.clone(),
                    path: image.path.clone(),
                })?;
            debug!(host = %target.host_id, url = %url, "Resolved image URL");
            handles.push(Arc::new(HostHandle::new(target, url)));
        }

        Ok(Self {
            agent,
            shared: Arc::new(shared),
            system: Arc::new(system),
            settings: Arc::new(settings),
            hosts: handles,
            os_pipeline: os_pipeline()?,
            packages: OnceCell::new(),
        })
    }

    /// Number of hosts.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Snapshot of host `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::IndexOutOfRange`] for a bad index.
    pub fn host(&self, index: usize) -> Result<HostTarget, DeployError> {
        Ok(self.handle(index)?.target())
    }

    /// Handle of host `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::IndexOutOfRange`] for a bad index.
    pub fn handle(&self, index: usize) -> Result<&Arc<HostHandle>, DeployError> {
        self.hosts.get(index).ok_or(DeployError::IndexOutOfRange {
            index,
            len: self.hosts.len(),
        })
    }

    /// Index of the host currently known under `host_id`.
    #[must_use]
    pub fn find_index_by_host_id(&self, host_id: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h.host_id() == host_id)
    }

    /// The OS install step table.
    #[must_use]
    pub fn os_pipeline(&self) -> &Pipeline<OsStep, StepContext> {
        &self.os_pipeline
    }

    fn context(&self, index: usize) -> Result<StepContext, DeployError> {
        Ok(StepContext {
            host: Arc::clone(self.handle(index)?),
            shared: Arc::clone(&self.shared),
            system: Arc::clone(&self.system),
            agent: Arc::clone(&self.agent),
            settings: Arc::clone(&self.settings),
        })
    }

    /// Install the OS on host `index`.
    ///
    /// # Errors
    ///
    /// Returns the failing step wrapped in [`DeployError::Pipeline`].
    pub async fn install_os_one(
        &self,
        index: usize,
        sink: &UnboundedSender<ProgressEvent<OsStep>>,
    ) -> Result<(), DeployError> {
        self.install_os_one_from_step(index, None, sink).await
    }

    /// Install the OS on host `index`, resuming at `step`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownStep`] without running anything for an
    /// unknown step, otherwise the failing step.
    pub async fn install_os_one_from_step(
        &self,
        index: usize,
        step: Option<&str>,
        sink: &UnboundedSender<ProgressEvent<OsStep>>,
    ) -> Result<(), DeployError> {
        let ctx = self.context(index)?;
        let host = ctx.host.host_id();
        self.os_pipeline
            .run_from_step(&host, &ctx, step, sink)
            .await?;
        Ok(())
    }

    /// Install the OS on every host concurrently. One result per host, in order.
    pub async fn install_os_all(
        &self,
        sink: &UnboundedSender<ProgressEvent<OsStep>>,
    ) -> Vec<Result<(), DeployError>> {
        join_all((0..self.hosts.len()).map(|i| self.install_os_one(i, sink))).await
    }

    async fn published_packages(&self) -> Result<&[PublishedPackage], DeployError> {
        let packages = self
            .packages
            .get_or_try_init(|| publish_packages(self.agent.as_ref(), &self.system.packages))
            .await?;
        Ok(packages.as_slice())
    }

    /// Install drivers on host `index`.
    ///
    /// # Errors
    ///
    /// Returns the failing step wrapped in [`DeployError::Pipeline`].
    pub async fn install_env_one(
        &self,
        index: usize,
        sink: &UnboundedSender<ProgressEvent<EnvStep>>,
    ) -> Result<(), DeployError> {
        self.install_env_one_from_step(index, None, sink).await
    }

    /// Install drivers on host `index`, resuming at `step`.
    ///
    /// Packages are published on first use and shared by all hosts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownStep`] before publishing anything for
    /// an unknown step, otherwise the failing step.
    pub async fn install_env_one_from_step(
        &self,
        index: usize,
        step: Option<&str>,
        sink: &UnboundedSender<ProgressEvent<EnvStep>>,
    ) -> Result<(), DeployError> {
        if let Some(name) = step {
            let known = name == "complete" || self.system.packages.iter().any(|p| p.name == name);
            if !known {
                return Err(PipelineError::UnknownStep {
                    stage: ENV_STAGE.to_string(),
                    name: name.to_string(),
                }
                .into());
            }
        }

        let ctx = self.context(index)?;
        let host = ctx.host.host_id();
        let packages = self.published_packages().await?;
        let pipeline = env_pipeline(self.agent.as_ref(), &host, packages).await?;
        pipeline.run_from_step(&host, &ctx, step, sink).await?;
        Ok(())
    }

    /// Install drivers on every host concurrently.
    pub async fn install_env_all(
        &self,
        sink: &UnboundedSender<ProgressEvent<EnvStep>>,
    ) -> Vec<Result<(), DeployError>> {
        join_all((0..self.hosts.len()).map(|i| self.install_env_one(i, sink))).await
    }

    /// Fetch and cache fresh host info.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::MissingHostInfo`] if the controller has none.
    pub async fn refresh_host_info(&self, index: usize) -> Result<HostInfo, DeployError> {
        let handle = self.handle(index)?;
        let host = handle.host_id();
        let info = self
            .agent
            .get_host_info(&host)
            .await?
            .ok_or(DeployError::MissingHostInfo(host))?;
        handle.set_info(info.clone());
        Ok(info)
    }

    /// Wait until host `index` reports a session other than the skipped one.
    ///
    /// Polls at `interval` and refreshes the cached host info on success.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Timeout`] once `timeout` has elapsed.
    pub async fn wait_until_ready(
        &self,
        index: usize,
        options: WaitOptions,
    ) -> Result<HostInfo, DeployError> {
        let handle = self.handle(index)?;
        let host = handle.host_id();
        let skip = options
            .skip_session_id
            .or_else(|| handle.pre_reboot_session())
            .or_else(|| handle.cached_info().map(|info| info.session_id))
            .unwrap_or_else(|| host.clone());
        info!(host = %host, skip_session = %skip, timeout_secs = options.timeout.as_secs(), "Waiting for host to come back");

        let start = Instant::now();
        loop {
            match self.agent.get_host_info(&host).await {
                Ok(Some(info)) if info.session_id != skip => {
                    info!(
                        host = %host,
                        session_id = %info.session_id,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Host is back"
                    );
                    handle.set_info(info.clone());
                    return Ok(info);
                }
                Ok(_) => debug!(host = %host, "Host still on old session"),
                Err(e) if e.kind().is_transient() || matches!(e, AgentError::SessionNotFound(_)) => {
                    debug!(host = %host, error = %e, "Host unreachable, still rebooting");
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= options.timeout {
                return Err(DeployError::Timeout {
                    host,
                    secs: options.timeout.as_secs(),
                });
            }
            tokio::time::sleep(options.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::testing::FakeAgent;
    use crate::error::ErrorKind;
    use crate::model::{Account, DriverPackage, InterfaceAddress, NetworkConfig, OsBase};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn host(id: &str) -> HostTarget {
        HostTarget {
            host_id: id.to_string(),
            disk: "/dev/nvme0n1".into(),
            hostname: format!("node-{id}"),
            addresses: vec![InterfaceAddress {
                mac: "52:54:00:00:00:01".into(),
                cidr: "10.0.0.10/24".into(),
            }],
            ssh: None,
        }
    }

    fn spec(ids: &[&str], packages: Vec<DriverPackage>) -> RunSpec {
        RunSpec {
            hosts: ids.iter().map(|id| host(id)).collect(),
            os_image_path: PathBuf::from("/srv/images/rootfs.tar.gz"),
            shared: SharedConfig {
                account: Account {
                    username: "ops".into(),
                    password: Some("pw".into()),
                },
                network: NetworkConfig::default(),
            },
            system: SystemMeta {
                os_base: OsBase {
                    distro: "ubuntu".into(),
                    version: "22.04".into(),
                    arch: "amd64".into(),
                    mirror: Some("http://mirror.local/ubuntu".into()),
                },
                packages,
            },
        }
    }

    async fn manager(agent: &Arc<FakeAgent>, spec: RunSpec) -> DeploymentManager {
        let agent: Arc<dyn AgentApi> = agent.clone();
        DeploymentManager::new(agent, spec, DeploySettings::default())
            .await
            .unwrap()
    }

    fn drain<S>(rx: &mut mpsc::UnboundedReceiver<ProgressEvent<S>>) -> Vec<ProgressEvent<S>> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_new_publishes_image_once() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1", "h2"], vec![])).await;

        assert_eq!(agent.published.lock().unwrap().len(), 1);
        assert_eq!(m.host_count(), 2);
        assert_eq!(m.handle(1).unwrap().image_url(), "http://controller.h2/published/rootfs");
        assert_eq!(m.find_index_by_host_id("h2"), Some(1));
        assert_eq!(m.find_index_by_host_id("h9"), None);
        assert!(matches!(m.host(5), Err(DeployError::IndexOutOfRange { index: 5, len: 2 })));
    }

    #[tokio::test]
    async fn test_new_fails_when_host_has_no_url() {
        let agent: Arc<dyn AgentApi> = Arc::new(FakeAgent {
            unreachable: vec!["h2".into()],
            ..FakeAgent::default()
        });
        let err = DeploymentManager::new(agent, spec(&["h1", "h2"], vec![]), DeploySettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NoUrl { ref host, .. } if host == "h2"));
    }

    #[tokio::test]
    async fn test_install_os_full_run() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        m.install_os_one(0, &tx).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), OsStep::ALL.len() + 1);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished { completed_step: OsStep::Complete, .. })
        ));

        let commands = agent.commands_for("h1");
        assert!(commands[0].contains("wipefs"));
        assert!(commands.iter().any(|c| c.contains("01-provisioner.yaml")));
        assert!(commands.iter().any(|c| c.contains("http://mirror.local/ubuntu")));
        assert!(commands.last().unwrap().contains("reboot"));

        let transfers = agent.transfers.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![(
                "h1".to_string(),
                "/var/tmp/provision/rootfs.tar.gz".to_string(),
                "http://controller.h1/published/rootfs".to_string()
            )]
        );
        assert_eq!(m.handle(0).unwrap().pre_reboot_session().as_deref(), Some("h1-session-0"));
    }

    #[tokio::test]
    async fn test_failed_step_then_resume() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        agent.fail_on("h1", "/etc/hostname");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = m.install_os_one(0, &tx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        match &err {
            DeployError::Pipeline(p) => assert_eq!(p.failed_step(), Some("configure_hostname")),
            other => panic!("unexpected error {other:?}"),
        }
        match drain(&mut rx).last() {
            Some(ProgressEvent::Failed { from, to, step, .. }) => {
                assert_eq!((*from, *to, *step), (78, 82, OsStep::ConfigureHostname));
            }
            other => panic!("unexpected event {other:?}"),
        }

        agent.clear_failures();
        let before = agent.commands_for("h1").len();
        m.install_os_one_from_step(0, Some("configure_hostname"), &tx)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            ProgressEvent::Running {
                stage: "os_install".into(),
                host: "h1".into(),
                from: 78,
                to: 82,
                completed_step: Some(OsStep::ConfigureNetwork),
                started_step: OsStep::ConfigureHostname,
            }
        );
        let resumed = &agent.commands_for("h1")[before..];
        assert!(resumed.iter().all(|c| !c.contains("wipefs")));
    }

    #[tokio::test]
    async fn test_unknown_step_runs_nothing() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = m
            .install_os_one_from_step(0, Some("format_everything"), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(drain(&mut rx).is_empty());
        assert!(agent.commands_for("h1").is_empty());

        let (etx, mut erx) = mpsc::unbounded_channel();
        let err = m.install_env_one_from_step(0, Some("nope"), &etx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(drain(&mut erx).is_empty());
        assert_eq!(agent.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_os_all_isolates_failures() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1", "h2"], vec![])).await;
        agent.fail_on("h2", "wipefs");
        let (tx, _rx) = mpsc::unbounded_channel();

        let results = m.install_os_all(&tx).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(agent.commands_for("h1").last().unwrap().contains("reboot"));
        assert_eq!(agent.commands_for("h2").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_returns_on_first_new_session() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        agent.script_sessions("h1", &["old", "old", "old", "new"]);

        let start = Instant::now();
        let info = m
            .wait_until_ready(
                0,
                WaitOptions {
                    skip_session_id: Some("old".into()),
                    interval: Duration::from_secs(2),
                    timeout: Duration::from_secs(10),
                },
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(info.session_id, "new");
        assert!(elapsed >= Duration::from_secs(6) && elapsed <= Duration::from_secs(8), "{elapsed:?}");
        assert_eq!(m.handle(0).unwrap().cached_info().unwrap().session_id, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        agent.script_sessions("h1", &["old"]);

        let err = m
            .wait_until_ready(
                0,
                WaitOptions {
                    skip_session_id: Some("old".into()),
                    interval: Duration::from_secs(2),
                    timeout: Duration::from_secs(5),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Timeout { secs: 5, .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_defaults_to_pre_reboot_session() {
        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1"], vec![])).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        m.install_os_one(0, &tx).await.unwrap();

        agent.script_sessions("h1", &["h1-session-0", "h1-session-1"]);
        let info = m.wait_until_ready(0, WaitOptions::default()).await.unwrap();
        assert_eq!(info.session_id, "h1-session-1");
    }

    #[tokio::test]
    async fn test_install_env_publishes_once_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cuda.run");
        std::fs::write(&source, b"bin").unwrap();
        let packages = vec![DriverPackage {
            name: "cuda".into(),
            source,
        }];

        let agent = Arc::new(FakeAgent::default());
        let m = manager(&agent, spec(&["h1", "h2"], packages)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let results = m.install_env_all(&tx).await;
        assert!(results.iter().all(Result::is_ok));
        // rootfs + one package
        assert_eq!(agent.published.lock().unwrap().len(), 2);

        let events = drain(&mut rx);
        let finished = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 2);

        let commands = agent.commands_for("h2");
        assert!(commands.iter().any(|c| c.contains("cuda.run") && c.contains("--silent")));
        assert!(commands.last().unwrap().contains("rm -rf"));
    }
}
