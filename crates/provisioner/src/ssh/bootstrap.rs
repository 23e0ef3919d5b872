//! Per-host bootstrap state machine.
//!
//! `Connected → PrivilegeChecked → SystemFingerprinted → AgentUploaded → AgentRunning`

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::output::{AgentOutputParser, DEFAULT_READY_MARKER};
use super::platform::{self, Arch, Fingerprint, OsFamily, PACKAGE_MANAGER_PROBE};
use super::shell::{PortForward, RemoteShell, ShellOutput, Ssh2Shell};
use super::{quote, SshError};
use crate::model::SshAccess;

/// Byte written to the PTY to interrupt the agent.
const INTERRUPT: u8 = 0x03;

/// Bootstrap progress of one host. Ordered: later states imply earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BootstrapState {
    /// Session open, nothing checked yet.
    Connected,
    /// Privilege escalation path known.
    PrivilegeChecked,
    /// OS, architecture and package manager known.
    SystemFingerprinted,
    /// Agent binary on the host and executable.
    AgentUploaded,
    /// Agent launched and connected to the controller.
    AgentRunning,
}

/// How privileged commands are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SudoMode {
    /// Already root; no sudo.
    Root,
    /// `sudo -n` works.
    Passwordless,
    /// `sudo -S` with the password on stdin.
    Password,
}

/// Bootstrap settings.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Local directory holding `<prefix>-<os>-<arch>` agent builds.
    pub agent_dir: PathBuf,
    /// Agent binary name prefix.
    pub agent_prefix: String,
    /// Remote directory the agent is uploaded to.
    pub remote_dir: String,
    /// Literal the agent prints when connected.
    pub readiness_marker: String,
    /// Bound on the readiness wait.
    pub readiness_timeout: Duration,
    /// Controller port on this machine, forwarded to the host.
    pub controller_port: u16,
    /// WebSocket path the agent dials.
    pub ws_path: String,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            agent_dir: PathBuf::from("./agents"),
            agent_prefix: "agent".to_string(),
            remote_dir: "/tmp".to_string(),
            readiness_marker: DEFAULT_READY_MARKER.to_string(),
            readiness_timeout: Duration::from_secs(60),
            controller_port: 8080,
            ws_path: "/ws/agent".to_string(),
        }
    }
}

/// Interrupts a running agent without closing the session.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    input: mpsc::UnboundedSender<Vec<u8>>,
}

impl AbortHandle {
    /// Write the interrupt byte. Returns `false` if the PTY is already gone.
    pub fn abort(&self) -> bool {
        self.input.send(vec![INTERRUPT]).is_ok()
    }
}

/// Bootstraps the remote agent over one [`RemoteShell`].
pub struct SshBootstrap<S: RemoteShell> {
    shell: S,
    settings: BootstrapSettings,
    sudo_password: Option<String>,
    state: BootstrapState,
    sudo_mode: Option<SudoMode>,
    fingerprint: Option<Fingerprint>,
    remote_agent: Option<String>,
    host_id: Option<String>,
    abort: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Controller port and the forward serving it; kept across relaunches.
    forward: Option<(u16, PortForward)>,
}

impl SshBootstrap<Ssh2Shell> {
    /// Open an SSH session and wrap it. The login password doubles as the sudo password.
    ///
    /// # Errors
    /// Returns an error if the session cannot be established.
    pub async fn connect(access: &SshAccess, settings: BootstrapSettings) -> Result<Self, SshError> {
        let shell = Ssh2Shell::connect(access).await?;
        Ok(Self::new(shell, settings, access.password.clone()))
    }
}

impl<S: RemoteShell> SshBootstrap<S> {
    /// Wrap an already connected shell.
    pub fn new(shell: S, settings: BootstrapSettings, sudo_password: Option<String>) -> Self {
        Self {
            shell,
            settings,
            sudo_password,
            state: BootstrapState::Connected,
            sudo_mode: None,
            fingerprint: None,
            remote_agent: None,
            host_id: None,
            abort: None,
            forward: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Detected sudo mode, once privilege is checked.
    #[must_use]
    pub fn sudo_mode(&self) -> Option<SudoMode> {
        self.sudo_mode
    }

    /// Detected platform, once fingerprinted.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Host id the running agent announced.
    #[must_use]
    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    /// The underlying shell.
    pub fn shell(&self) -> &S {
        &self.shell
    }

    fn require(&self, expected: BootstrapState) -> Result<(), SshError> {
        if self.state < expected {
            return Err(SshError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    async fn exec_checked(&self, command: &str) -> Result<ShellOutput, SshError> {
        let out = self.shell.exec(command, None).await?;
        if !out.success() {
            return Err(SshError::CommandFailed {
                command: command.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Find a way to run privileged commands.
    ///
    /// # Errors
    /// [`SshError::SudoPasswordRequired`] when sudo needs a password and none is
    /// configured, [`SshError::SudoPasswordIncorrect`] when it is rejected, and
    /// [`SshError::NoSudoRights`] for any other sudo failure.
    pub async fn force_sudo(&mut self) -> Result<SudoMode, SshError> {
        let id = self.shell.exec("id -u", None).await?;
        let mode = if id.success() && id.stdout.trim() == "0" {
            SudoMode::Root
        } else if self.shell.exec("sudo -n true", None).await?.success() {
            SudoMode::Passwordless
        } else {
            let password = self
                .sudo_password
                .as_deref()
                .ok_or(SshError::SudoPasswordRequired)?;
            let out = self
                .shell
                .exec("sudo -S -p '' true", Some(&format!("{password}\n")))
                .await?;
            if !out.success() {
                let text = out.combined().to_lowercase();
                if text.contains("incorrect password") || text.contains("sorry, try again") {
                    return Err(SshError::SudoPasswordIncorrect);
                }
                return Err(SshError::NoSudoRights(out.combined().trim().to_string()));
            }
            SudoMode::Password
        };

        info!(mode = ?mode, "Privilege escalation available");
        self.sudo_mode = Some(mode);
        self.state = self.state.max(BootstrapState::PrivilegeChecked);
        Ok(mode)
    }

    fn sudo_prefix(&self) -> Result<(&'static str, Option<String>), SshError> {
        match self.sudo_mode {
            Some(SudoMode::Root) => Ok(("", None)),
            Some(SudoMode::Passwordless) => Ok(("sudo -n ", None)),
            Some(SudoMode::Password) => Ok((
                "sudo -S -p '' ",
                self.sudo_password.as_ref().map(|p| format!("{p}\n")),
            )),
            None => Err(SshError::InvalidState {
                expected: BootstrapState::PrivilegeChecked,
                actual: self.state,
            }),
        }
    }

    /// Run a command with elevated privilege.
    ///
    /// # Errors
    /// Returns [`SshError::CommandFailed`] on a non-zero exit.
    pub async fn sudo_exec(&self, command: &str) -> Result<ShellOutput, SshError> {
        let (prefix, stdin) = self.sudo_prefix()?;
        let wrapped = format!("{prefix}sh -c {}", quote(command));
        debug!(command = %command, "Running privileged command");

        let out = self.shell.exec(&wrapped, stdin.as_deref()).await?;
        if !out.success() {
            return Err(SshError::CommandFailed {
                command: command.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Detect OS family, architecture and package manager.
    ///
    /// # Errors
    /// Returns an error for unsupported platforms or failed probes.
    pub async fn fingerprint_system(&mut self) -> Result<Fingerprint, SshError> {
        self.require(BootstrapState::PrivilegeChecked)?;

        let os = OsFamily::parse(&self.exec_checked("uname -s").await?.stdout)?;
        let raw_arch = self.exec_checked("uname -m").await?.stdout.trim().to_string();
        let arch = Arch::parse(&raw_arch)?;
        let probe = self.shell.exec(PACKAGE_MANAGER_PROBE, None).await?;
        let package_manager = Some(probe.stdout.trim().to_string()).filter(|pm| !pm.is_empty());

        let fingerprint = Fingerprint {
            os,
            arch,
            raw_arch,
            package_manager,
        };
        info!(
            os = %fingerprint.os,
            arch = %fingerprint.arch,
            package_manager = ?fingerprint.package_manager,
            "System fingerprinted"
        );
        self.fingerprint = Some(fingerprint.clone());
        self.state = self.state.max(BootstrapState::SystemFingerprinted);
        Ok(fingerprint)
    }

    /// Local agent build matching the fingerprint.
    ///
    /// # Errors
    /// Returns [`SshError::AgentBinaryNotFound`] when nothing matches.
    pub fn select_agent_binary(&self) -> Result<PathBuf, SshError> {
        self.require(BootstrapState::SystemFingerprinted)?;
        let fp = self.fingerprint.as_ref().ok_or(SshError::InvalidState {
            expected: BootstrapState::SystemFingerprinted,
            actual: self.state,
        })?;
        platform::select_agent_binary(
            &self.settings.agent_dir,
            &self.settings.agent_prefix,
            fp.os,
            fp.arch,
        )
    }

    /// Upload the agent and make it executable. Returns its remote path.
    ///
    /// # Errors
    /// Returns an error if no binary matches or the upload fails.
    pub async fn upload_agent(&mut self) -> Result<String, SshError> {
        let local = self.select_agent_binary()?;
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.settings.agent_prefix.clone());
        let remote = format!("{}/{name}", self.settings.remote_dir.trim_end_matches('/'));

        self.shell.upload(Path::new(&local), &remote, 0o755).await?;
        self.exec_checked(&format!("chmod +x {}", quote(&remote))).await?;

        info!(local = %local.display(), remote = %remote, "Agent uploaded");
        self.remote_agent = Some(remote.clone());
        self.state = self.state.max(BootstrapState::AgentUploaded);
        Ok(remote)
    }

    /// Launch the agent and wait until it reports readiness.
    ///
    /// Forwards `controller_port` to the host's loopback, starts the agent
    /// under sudo with a PTY, and resolves with the announced host id once the
    /// readiness marker appears. The process keeps running afterwards.
    ///
    /// # Errors
    /// Returns [`SshError::ReadinessTimeout`], [`SshError::AgentExited`] or
    /// [`SshError::AgentIdentityMissing`] when the launch does not complete.
    pub async fn spawn_agent(&mut self, controller_port: u16) -> Result<String, SshError> {
        if self.state != BootstrapState::AgentUploaded {
            return Err(SshError::InvalidState {
                expected: BootstrapState::AgentUploaded,
                actual: self.state,
            });
        }
        let agent = self.remote_agent.clone().ok_or(SshError::InvalidState {
            expected: BootstrapState::AgentUploaded,
            actual: self.state,
        })?;

        let remote_port = self.ensure_forward(controller_port).await?;

        let (prefix, stdin) = self.sudo_prefix()?;
        let command = format!(
            "{prefix}{} -w ws://127.0.0.1:{remote_port}{}",
            quote(&agent),
            self.settings.ws_path
        );
        info!(command = %command, "Launching agent");
        let process = self.shell.spawn_pty(&command, stdin.as_deref()).await?;
        let mut output = process.output;
        let input = process.input;

        let mut parser = AgentOutputParser::new(self.settings.readiness_marker.clone());
        let wait = tokio::time::timeout(self.settings.readiness_timeout, async {
            while let Some(chunk) = output.recv().await {
                if parser.feed(&chunk).ready {
                    return Ok(());
                }
            }
            Err(SshError::AgentExited(parser.tail().to_string()))
        })
        .await;

        let outcome = match wait {
            Ok(Ok(())) => parser.snapshot().host_id.ok_or(SshError::AgentIdentityMissing),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SshError::ReadinessTimeout(
                self.settings.readiness_timeout.as_secs(),
            )),
        };
        let host_id = match outcome {
            Ok(id) => id,
            Err(e) => {
                let _ = input.send(vec![INTERRUPT]);
                return Err(e);
            }
        };

        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                debug!(output = %chunk.trim_end(), "agent");
            }
            debug!("Agent output closed");
        });

        info!(host_id = %host_id, "Agent running");
        self.host_id = Some(host_id.clone());
        self.abort = Some(input);
        self.state = BootstrapState::AgentRunning;
        Ok(host_id)
    }

    /// Reuse the forward for `controller_port`, or replace whatever was open.
    async fn ensure_forward(&mut self, controller_port: u16) -> Result<u16, SshError> {
        if let Some((port, forward)) = &self.forward {
            if *port == controller_port && !forward.is_cancelled() {
                debug!(remote_port = forward.port(), "Reusing port forward");
                return Ok(forward.port());
            }
        }
        self.close_forward();

        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, controller_port));
        let forward = self.shell.forward_remote_port(controller_port, local).await?;
        let remote_port = forward.port();
        self.forward = Some((controller_port, forward));
        Ok(remote_port)
    }

    /// Tear down the controller port forward. A later launch opens a new one.
    pub fn close_forward(&mut self) {
        if let Some((_, forward)) = self.forward.take() {
            forward.cancel();
        }
    }

    /// Handle for interrupting the running agent from elsewhere.
    #[must_use]
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.abort.clone().map(|input| AbortHandle { input })
    }

    /// Interrupt the agent and forget its identity so it can be launched again.
    ///
    /// The port forward stays open for the next [`Self::spawn_agent`].
    pub fn kill_agent(&mut self) {
        if let Some(input) = self.abort.take() {
            if input.send(vec![INTERRUPT]).is_err() {
                warn!("Agent PTY already closed");
            }
        }
        self.host_id = None;
        if self.state == BootstrapState::AgentRunning {
            self.state = BootstrapState::AgentUploaded;
        }
    }

    /// Run the full sequence. Returns the agent's host id.
    ///
    /// # Errors
    /// Returns the first failing stage's error.
    pub async fn bootstrap(&mut self) -> Result<String, SshError> {
        if self.sudo_mode.is_none() {
            self.force_sudo().await?;
        }
        if self.fingerprint.is_none() {
            self.fingerprint_system().await?;
        }
        if self.state < BootstrapState::AgentUploaded {
            self.upload_agent().await?;
        }
        self.spawn_agent(self.settings.controller_port).await
    }
}

impl<S: RemoteShell> Drop for SshBootstrap<S> {
    fn drop(&mut self) {
        self.close_forward();
    }
}
