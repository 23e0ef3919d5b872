//! Provisioning CLI.
//!
//! Drives OS and driver installation across the hosts of a run file through
//! the agent controller, bootstraps agents over SSH, and runs plain SSH
//! package operations for hosts without an agent.

#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod ui;

use commands::bootstrap::BootstrapCommand;
use commands::download::DownloadCommand;
use commands::info::InfoCommand;
use commands::install::{InstallEnvCommand, InstallOsCommand};
use commands::provision::ProvisionCommand;
use commands::ssh_deploy::SshDeployCommand;
use commands::steps::StepsCommand;
use commands::wait::WaitReadyCommand;

/// Host provisioning orchestrator.
#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Provision hosts: install an OS image, configure it, then install drivers",
    long_about = "Provision bare metal hosts through a remote agent controller.\n\n\
                  Every host runs its own resumable step pipeline. A failed host\n\
                  can be resumed with --from-step using the step name printed\n\
                  in the failure summary."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, install and configure the OS on one or all hosts, then reboot.
    InstallOs(InstallOsCommand),

    /// Install the configured driver packages on one or all hosts.
    InstallEnv(InstallEnvCommand),

    /// Wait for a host to come back after its reboot.
    WaitReady(WaitReadyCommand),

    /// Show what the controller currently knows about a host.
    Info(InfoCommand),

    /// Full run per host: OS install, reboot wait, driver install.
    Provision(ProvisionCommand),

    /// Launch the agent on a host over SSH.
    Bootstrap(BootstrapCommand),

    /// Package manager operations over plain SSH.
    SshDeploy(SshDeployCommand),

    /// Download a metalink through aria2.
    Download(DownloadCommand),

    /// Print the OS install step table.
    Steps(StepsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,provisioner=debug,provision_cli=debug")
    } else {
        EnvFilter::new("warn,provisioner=info,provision_cli=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::InstallOs(cmd) => cmd.run().await,
        Commands::InstallEnv(cmd) => cmd.run().await,
        Commands::WaitReady(cmd) => cmd.run().await,
        Commands::Info(cmd) => cmd.run().await,
        Commands::Provision(cmd) => cmd.run().await,
        Commands::Bootstrap(cmd) => cmd.run().await,
        Commands::SshDeploy(cmd) => cmd.run().await,
        Commands::Download(cmd) => cmd.run().await,
        Commands::Steps(cmd) => {
            cmd.run();
            Ok(())
        }
    }
}
