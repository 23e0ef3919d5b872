use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use provisioner::ssh::{BootstrapSettings, Ssh2Shell, SshBootstrap};

use crate::config::{RunArgs, RunFile};
use crate::ui;

/// Launch the agent on a host over SSH
#[derive(Args)]
pub struct BootstrapCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Host to bootstrap; needs an `ssh` block in the run file.
    #[arg(long, value_name = "ID")]
    host: String,

    /// Directory holding `agent-<os>-<arch>` builds.
    #[arg(long, value_name = "DIR", default_value = "./agents")]
    agent_dir: PathBuf,

    /// Local controller port forwarded to the host.
    #[arg(long, default_value_t = 8080)]
    controller_port: u16,

    /// Seconds to wait for the agent to connect.
    #[arg(long, default_value_t = 60)]
    readiness_timeout: u64,

    /// Sudo password (defaults to the SSH password).
    #[arg(long, env = "PROVISION_SUDO_PASSWORD", hide_env_values = true)]
    sudo_password: Option<String>,
}

impl BootstrapCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("🔌 Agent Bootstrap");

        let file = RunFile::load(&self.run.config)?;
        let target = file
            .spec
            .hosts
            .iter()
            .find(|h| h.host_id == self.host)
            .with_context(|| format!("Host '{}' is not in the run file", self.host))?;
        let access = target
            .ssh
            .as_ref()
            .with_context(|| format!("Host '{}' has no ssh access configured", self.host))?;

        ui::print_step(&format!("Connecting to {}@{}:{}", access.username, access.address, access.port));
        let shell = Ssh2Shell::connect(access).await?;
        let settings = BootstrapSettings {
            agent_dir: self.agent_dir.clone(),
            controller_port: self.controller_port,
            readiness_timeout: Duration::from_secs(self.readiness_timeout),
            ..BootstrapSettings::default()
        };
        let password = self.sudo_password.clone().or_else(|| access.password.clone());
        let mut bootstrap = SshBootstrap::new(shell, settings, password);

        let mode = bootstrap.force_sudo().await?;
        ui::print_kv("privileges", &format!("{mode:?}"));
        let fingerprint = bootstrap.fingerprint_system().await?;
        ui::print_kv("platform", &format!("{}/{}", fingerprint.os, fingerprint.arch));

        ui::print_step("Uploading and launching agent");
        let host_id = match bootstrap.bootstrap().await {
            Ok(id) => id,
            Err(e) => {
                ui::print_error(&format!("Bootstrap stopped in state {:?}", bootstrap.state()));
                return Err(e.into());
            }
        };
        ui::print_success("Agent connected");
        ui::print_kv("host id", &host_id);

        ui::print_info("Agent runs while this session stays open; press Ctrl-C to stop it");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        bootstrap.kill_agent();
        bootstrap.close_forward();
        ui::print_warning("Agent stopped");
        Ok(())
    }
}
