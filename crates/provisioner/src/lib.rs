//! Host provisioning orchestration.
//!
//! This crate turns a list of target machines plus a declarative run
//! description into concrete provisioning work: partition and install an OS
//! image, configure network/hostname/user/mirrors, reboot, then install
//! drivers. Hosts run concurrently; steps within a host run in order and a
//! failed host can be resumed from the exact step that failed.
//!
//! Hosts are reached through a remote agent fronted by a controller
//! ([`agent`]). When a host has no agent yet, [`ssh`] bootstraps one over SSH,
//! and [`ssh_deploy`] offers plain package-manager operations without it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use provisioner::agent::AgentClient;
//! use provisioner::deploy::{DeploySettings, DeploymentManager, WaitOptions};
//! use provisioner::model::RunSpec;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = RunSpec::load("run.yaml".as_ref())?;
//!     let agent = Arc::new(AgentClient::new("http://controller:8080/api")?);
//!     let manager = DeploymentManager::new(agent, spec, DeploySettings::default()).await?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     tokio::spawn(async move {
//!         while let Some(event) = rx.recv().await {
//!             println!("{}", serde_json::to_string(&event).unwrap());
//!         }
//!     });
//!
//!     manager.install_os_one(0, &tx).await?;
//!     manager.wait_until_ready(0, WaitOptions::default()).await?;
//!     manager.install_env_one(0, &tx).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod deploy;
pub mod download;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod ssh;
pub mod ssh_deploy;

pub use agent::{AgentApi, AgentClient, AgentError};
pub use deploy::{DeployError, DeploySettings, DeploymentManager, WaitOptions};
pub use error::{Classify, ErrorKind};
pub use model::RunSpec;
pub use pipeline::{Pipeline, PipelineError, ProgressEvent};
