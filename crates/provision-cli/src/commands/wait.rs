use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use provisioner::deploy::WaitOptions;

use crate::config::RunArgs;
use crate::ui;

/// Wait for a host to come back after its reboot
#[derive(Args)]
pub struct WaitReadyCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Host to wait for.
    #[arg(long, value_name = "ID")]
    host: String,

    /// Session id of the agent before the reboot (printed by install-os).
    #[arg(long, value_name = "SESSION")]
    skip_session: Option<String>,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 900)]
    timeout: u64,

    /// Seconds between polls.
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

impl WaitReadyCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("⏳ Waiting for Host");

        let config = self.run.load()?;
        let manager = config.manager().await?;
        let index = manager
            .find_index_by_host_id(&self.host)
            .with_context(|| format!("Host '{}' is not in the run file", self.host))?;

        ui::print_step(&format!(
            "Polling {} every {}s for up to {}s",
            self.host, self.interval, self.timeout
        ));
        let info = manager
            .wait_until_ready(
                index,
                WaitOptions {
                    skip_session_id: self.skip_session.clone(),
                    interval: Duration::from_secs(self.interval),
                    timeout: Duration::from_secs(self.timeout),
                },
            )
            .await?;

        ui::print_success(&format!("{} is back", self.host));
        ui::print_kv("session", &info.session_id);
        ui::print_kv("os", &info.system_info.os);
        ui::print_kv("arch", &info.system_info.arch);
        if let Some(hostname) = &info.system_info.hostname {
            ui::print_kv("hostname", hostname);
        }
        Ok(())
    }
}
