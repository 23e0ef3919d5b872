use anyhow::{bail, Result};
use clap::Args;

use crate::commands::fan_out;
use crate::config::RunArgs;
use crate::ui;

/// Install the OS image on one or all hosts
#[derive(Args)]
pub struct InstallOsCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Only this host.
    #[arg(long, value_name = "ID")]
    host: Option<String>,

    /// Resume from this step.
    #[arg(long, value_name = "STEP", requires = "host")]
    from_step: Option<String>,
}

impl InstallOsCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("🖥  OS Installation");

        let config = self.run.load()?;
        let indices = config.select_hosts(self.host.as_deref())?;
        ui::print_step("Publishing OS image");
        let manager = config.manager().await?;
        ui::print_success(&format!("Image published for {} host(s)", manager.host_count()));

        let step = self.from_step.as_deref();
        let outcomes = fan_out(&manager, &indices, |i, tx| {
            let manager = &manager;
            async move { manager.install_os_one_from_step(i, step, &tx).await }
        })
        .await?;

        for &i in &indices {
            let handle = manager.handle(i)?;
            if let Some(session) = handle.pre_reboot_session() {
                ui::print_kv(&format!("{} pre-reboot session", handle.host_id()), &session);
            }
        }

        let failures = ui::print_summary("install-os", "--from-step", &outcomes);
        if failures > 0 {
            bail!("OS installation failed on {failures} host(s)");
        }
        ui::print_info("Hosts are rebooting; run `provision wait-ready --host <ID>` next");
        Ok(())
    }
}

/// Install driver packages on one or all hosts
#[derive(Args)]
pub struct InstallEnvCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Only this host.
    #[arg(long, value_name = "ID")]
    host: Option<String>,

    /// Resume from this package step (or `complete`).
    #[arg(long, value_name = "STEP", requires = "host")]
    from_step: Option<String>,
}

impl InstallEnvCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("📦 Driver Installation");

        let config = self.run.load()?;
        let indices = config.select_hosts(self.host.as_deref())?;
        if config.spec.system.packages.is_empty() {
            ui::print_warning("No packages configured; only the cleanup step will run");
        }
        let manager = config.manager().await?;

        let step = self.from_step.as_deref();
        let outcomes = fan_out(&manager, &indices, |i, tx| {
            let manager = &manager;
            async move { manager.install_env_one_from_step(i, step, &tx).await }
        })
        .await?;

        let failures = ui::print_summary("install-env", "--from-step", &outcomes);
        if failures > 0 {
            bail!("Driver installation failed on {failures} host(s)");
        }
        ui::print_success("Drivers installed");
        Ok(())
    }
}
