//! CLI subcommands.

pub mod bootstrap;
pub mod download;
pub mod info;
pub mod install;
pub mod provision;
pub mod ssh_deploy;
pub mod steps;
pub mod wait;

use std::fmt::Display;
use std::future::Future;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedSender};

use provisioner::deploy::{DeployError, DeploymentManager};
use provisioner::pipeline::ProgressEvent;

use crate::ui::{HostBars, HostOutcome};

/// Run one pipeline per selected host concurrently, rendering events as bars.
pub(crate) async fn fan_out<S, F, Fut>(
    manager: &DeploymentManager,
    indices: &[usize],
    run_one: F,
) -> Result<Vec<HostOutcome>>
where
    S: Display,
    F: Fn(usize, UnboundedSender<ProgressEvent<S>>) -> Fut,
    Fut: Future<Output = Result<(), DeployError>>,
{
    let hosts = indices
        .iter()
        .map(|&i| manager.host(i).map(|h| h.host_id))
        .collect::<Result<Vec<_>, _>>()?;
    let bars = HostBars::new(hosts.iter().map(String::as_str));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let work = async move {
        let results = join_all(indices.iter().map(|&i| run_one(i, tx.clone()))).await;
        drop(tx);
        results
    };
    let render = async {
        while let Some(event) = rx.recv().await {
            bars.apply(&event);
        }
    };
    let (results, ()) = tokio::join!(work, render);
    bars.finish();

    Ok(hosts
        .into_iter()
        .zip(results)
        .map(|(host, result)| outcome(host, result))
        .collect())
}

pub(crate) fn outcome(host: String, result: Result<(), DeployError>) -> HostOutcome {
    match result {
        Ok(()) => HostOutcome {
            host,
            error: None,
            resume_step: None,
        },
        Err(e) => {
            let resume_step = match &e {
                DeployError::Pipeline(p) => p.failed_step().map(str::to_string),
                _ => None,
            };
            HostOutcome {
                host,
                error: Some(e.to_string()),
                resume_step,
            }
        }
    }
}
