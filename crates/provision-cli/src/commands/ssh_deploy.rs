use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use provisioner::ssh::{BootstrapSettings, ShellOutput, Ssh2Shell, SshBootstrap};
use provisioner::ssh_deploy::SshDeployer;

use crate::config::{RunArgs, RunFile};
use crate::ui;

/// Package manager operations over plain SSH
#[derive(Args)]
pub struct SshDeployCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Target host; needs an `ssh` block in the run file.
    #[arg(long, value_name = "ID")]
    host: String,

    /// Sudo password (defaults to the SSH password).
    #[arg(long, env = "PROVISION_SUDO_PASSWORD", hide_env_values = true)]
    sudo_password: Option<String>,

    #[command(subcommand)]
    action: DeployAction,
}

#[derive(Subcommand)]
enum DeployAction {
    /// Install Docker unless already present.
    Docker,
    /// Install the base tool set.
    Deps,
    /// Point sources at a mirror and refresh indexes.
    Sources {
        /// Mirror base URL; refresh only when omitted.
        #[arg(long)]
        mirror: Option<String>,
    },
    /// Install packages.
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Remove packages.
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
    },
}

impl SshDeployCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("🔧 SSH Deploy");

        let file = RunFile::load(&self.run.config)?;
        let access = file
            .spec
            .hosts
            .iter()
            .find(|h| h.host_id == self.host)
            .and_then(|h| h.ssh.as_ref())
            .with_context(|| format!("Host '{}' has no ssh access configured", self.host))?;

        let shell = Ssh2Shell::connect(access).await?;
        let password = self.sudo_password.clone().or_else(|| access.password.clone());
        let mut bootstrap = SshBootstrap::new(shell, BootstrapSettings::default(), password);
        bootstrap.force_sudo().await?;
        bootstrap.fingerprint_system().await?;
        let deployer = SshDeployer::new(bootstrap)?;
        ui::print_kv("package manager", &deployer.package_manager().to_string());

        let output = match &self.action {
            DeployAction::Docker => deployer.install_docker().await?,
            DeployAction::Deps => deployer.install_base_dependencies().await?,
            DeployAction::Sources { mirror } => deployer.update_sources(mirror.as_deref()).await?,
            DeployAction::Install { packages } => {
                deployer.install(&as_strs(packages)).await?
            }
            DeployAction::Uninstall { packages } => {
                deployer.uninstall(&as_strs(packages)).await?
            }
        };

        print_tail(&output);
        ui::print_success("Done");
        Ok(())
    }
}

fn as_strs(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

fn print_tail(output: &ShellOutput) {
    let text = output.combined();
    let lines: Vec<&str> = text.lines().collect();
    for line in &lines[lines.len().saturating_sub(10)..] {
        println!("  {line}");
    }
}
