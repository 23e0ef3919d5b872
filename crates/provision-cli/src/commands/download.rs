use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use provisioner::download::{Aria2Client, DownloadProgress, MetalinkDownload};

use crate::config::RunFile;
use crate::ui;

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:6800/jsonrpc";

/// Download a metalink through aria2
#[derive(Args)]
pub struct DownloadCommand {
    /// Metalink URL.
    #[arg(long)]
    url: String,

    /// Download directory on the aria2 host.
    #[arg(long, value_name = "DIR")]
    dir: Option<String>,

    /// Run file to read the aria2 section from.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// aria2 JSON-RPC endpoint.
    #[arg(long, value_name = "URL", env = "ARIA2_RPC_URL")]
    rpc_url: Option<String>,

    /// aria2 RPC secret.
    #[arg(long, env = "ARIA2_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Milliseconds between polls.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn render(bar: &ProgressBar, progress: &DownloadProgress) {
    bar.set_position(progress.percent.round().clamp(0.0, 100.0) as u64);
    bar.set_message(format!(
        "{}/{} done, {} failed, {} MiB of {} MiB",
        progress.completed_count,
        progress.total_count,
        progress.failed_count,
        progress.completed_bytes / (1024 * 1024),
        progress.total_bytes / (1024 * 1024),
    ));
}

impl DownloadCommand {
    fn endpoint(&self) -> Result<(String, Option<String>)> {
        let section = match &self.config {
            Some(path) => RunFile::load(path)?.aria2,
            None => Default::default(),
        };
        let url = self
            .rpc_url
            .clone()
            .or(section.rpc_url)
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        Ok((url, self.secret.clone().or(section.secret)))
    }

    pub async fn run(&self) -> Result<()> {
        ui::print_section("⬇  Metalink Download");

        let (rpc_url, secret) = self.endpoint()?;
        let client = Arc::new(Aria2Client::new(&rpc_url, secret)?);
        ui::print_kv("aria2", &rpc_url);

        let mut download = MetalinkDownload::start(client, &self.url, self.dir.as_deref()).await?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40.cyan/bright_black}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        let report = download
            .run(Duration::from_millis(self.interval_ms), |progress| {
                render(&bar, progress);
                !stop.load(Ordering::SeqCst)
            })
            .await?;
        bar.finish();

        if report.cancelled {
            ui::print_warning(&format!(
                "Cancelled after {} of {} files",
                report.progress.completed_count, report.progress.total_count
            ));
            return Ok(());
        }
        for failed in &report.failed {
            ui::print_error(&format!("{}: {}", failed.gid, failed.message));
        }
        if !report.success {
            bail!("{} of {} files failed", report.failed.len(), report.progress.total_count);
        }
        ui::print_success(&format!("Downloaded {} file(s)", report.completed.len()));
        Ok(())
    }
}
