use anyhow::{Context, Result};
use clap::Args;

use crate::config::RunArgs;
use crate::ui;

/// Show what the controller currently knows about a host
#[derive(Args)]
pub struct InfoCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Host to query.
    #[arg(long, value_name = "ID")]
    host: String,
}

impl InfoCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("🔎 Host Info");

        let config = self.run.load()?;
        let manager = config.manager().await?;
        let index = manager
            .find_index_by_host_id(&self.host)
            .with_context(|| format!("Host '{}' is not in the run file", self.host))?;

        let info = manager.refresh_host_info(index).await?;
        ui::print_kv("session", &info.session_id);
        ui::print_kv("os", &info.system_info.os);
        ui::print_kv("arch", &info.system_info.arch);
        if let Some(hostname) = &info.system_info.hostname {
            ui::print_kv("hostname", hostname);
        }
        for nic in &info.system_info.nics {
            ui::print_kv(&nic.name, &format!("{} {}", nic.mac, nic.addresses.join(" ")));
        }
        for disk in &info.system_info.disks {
            ui::print_kv(&disk.name, &format!("{} GiB", disk.size_bytes >> 30));
        }
        if let Some(seen) = info.last_seen {
            ui::print_kv("last seen", &seen.to_rfc3339());
        }
        Ok(())
    }
}
