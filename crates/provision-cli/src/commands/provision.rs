use std::fmt::Display;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use provisioner::deploy::{DeploymentManager, WaitOptions};
use provisioner::pipeline::ProgressEvent;
use provisioner::progress::{
    ActorJob, ActorRef, ActorSpec, ActorStatus, ProgressError, ProgressGroup, ProgressUpdate,
    Reporter,
};

use crate::config::RunArgs;
use crate::ui::{self, HostBars, HostOutcome};

/// Stage to start a host's run from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    Os,
    Reboot,
    Env,
}

impl Stage {
    fn actor(self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::Reboot => "reboot",
            Self::Env => "env",
        }
    }
}

/// Full run: OS install, reboot wait and driver install
#[derive(Args)]
pub struct ProvisionCommand {
    #[command(flatten)]
    run: RunArgs,

    /// Only this host.
    #[arg(long, value_name = "ID")]
    host: Option<String>,

    /// Skip the stages before this one.
    #[arg(long, value_enum, default_value_t = Stage::Os)]
    from: Stage,

    /// Agent session from before the reboot (printed by install-os).
    /// Required with `--from reboot`.
    #[arg(long, value_name = "SESSION", requires = "host")]
    skip_session: Option<String>,
}

/// A fresh process has no pre-reboot session on record, so resuming at the
/// reboot wait needs it from the caller.
fn check_resume(from: Stage, skip_session: Option<&str>) -> Result<()> {
    if from == Stage::Reboot && skip_session.is_none() {
        bail!(
            "--from reboot needs --host and --skip-session <SESSION> \
             (the agent session printed by install-os before the reboot)"
        );
    }
    Ok(())
}

fn actors() -> Vec<ActorSpec> {
    vec![
        ActorSpec::real("os")
            .with_ratio(50.0)
            .with_message("Installing OS"),
        ActorSpec::fake("reboot")
            .with_ratio(10.0)
            .with_message("Waiting for reboot"),
        ActorSpec::real("env").with_message("Installing drivers"),
    ]
}

/// Forward pipeline events into an actor's band.
async fn forward<S: Display>(reporter: &Reporter, mut rx: UnboundedReceiver<ProgressEvent<S>>) {
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::Running {
            from, started_step, ..
        } = &event
        {
            reporter.progress_with(f64::from(*from), Some(started_step.to_string()));
        }
    }
}

struct OsJob {
    manager: Arc<DeploymentManager>,
    index: usize,
}

#[async_trait]
impl ActorJob for OsJob {
    async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = &self.manager;
        let index = self.index;
        let install = async move { manager.install_os_one(index, &tx).await };
        let (result, ()) = tokio::join!(install, forward(&reporter, rx));
        Ok(result?)
    }
}

struct RebootJob {
    manager: Arc<DeploymentManager>,
    index: usize,
    skip_session: Option<String>,
}

#[async_trait]
impl ActorJob for RebootJob {
    async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
        let info = self
            .manager
            .wait_until_ready(
                self.index,
                WaitOptions {
                    skip_session_id: self.skip_session.clone(),
                    ..WaitOptions::default()
                },
            )
            .await?;
        reporter.message(format!("back with session {}", info.session_id));
        Ok(())
    }
}

struct EnvJob {
    manager: Arc<DeploymentManager>,
    index: usize,
}

#[async_trait]
impl ActorJob for EnvJob {
    async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = &self.manager;
        let index = self.index;
        let install = async move { manager.install_env_one(index, &tx).await };
        let (result, ()) = tokio::join!(install, forward(&reporter, rx));
        Ok(result?)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_percent(update: &ProgressUpdate) -> u64 {
    update.percent.round().clamp(0.0, 100.0) as u64
}

impl ProvisionCommand {
    pub async fn run(&self) -> Result<()> {
        ui::print_section("🚀 Provisioning");
        check_resume(self.from, self.skip_session.as_deref())?;
        let skip_session = self
            .skip_session
            .clone()
            .filter(|_| self.from == Stage::Reboot);

        let config = self.run.load()?;
        let indices = config.select_hosts(self.host.as_deref())?;
        let manager = Arc::new(config.manager().await?);

        let hosts = indices
            .iter()
            .map(|&i| manager.host(i).map(|h| h.host_id))
            .collect::<Result<Vec<_>, _>>()?;
        let bars = HostBars::new(hosts.iter().map(String::as_str));

        let runs = indices.iter().zip(&hosts).map(|(&index, host)| {
            let manager = Arc::clone(&manager);
            let skip_session = skip_session.clone();
            let bars = &bars;
            async move {
                let jobs: Vec<Arc<dyn ActorJob>> = vec![
                    Arc::new(OsJob {
                        manager: Arc::clone(&manager),
                        index,
                    }),
                    Arc::new(RebootJob {
                        manager: Arc::clone(&manager),
                        index,
                        skip_session,
                    }),
                    Arc::new(EnvJob { manager, index }),
                ];
                let mut group = ProgressGroup::new(actors())?;
                let (tx, mut rx) = mpsc::unbounded_channel();

                let run = async move {
                    group
                        .run_from(ActorRef::from(self.from.actor()), &jobs, &tx)
                        .await
                };
                let render = async {
                    while let Some(update) = rx.recv().await {
                        let message = match (&update.message, update.status) {
                            (_, ActorStatus::Error) => format!("{} failed", update.actor),
                            (Some(m), _) => format!("{}: {m}", update.actor),
                            (None, _) => update.actor.clone(),
                        };
                        bars.update(host, whole_percent(&update), message);
                    }
                };
                let (result, ()) = tokio::join!(run, render);
                Ok::<(), ProgressError>(result?)
            }
        });
        let results = join_all(runs).await;
        bars.finish();

        let outcomes: Vec<HostOutcome> = hosts
            .into_iter()
            .zip(results)
            .map(|(host, result)| HostOutcome {
                host,
                resume_step: match &result {
                    Err(ProgressError::ActorFailed { name, .. }) => Some(name.clone()),
                    _ => None,
                },
                error: result.err().map(|e| e.to_string()),
            })
            .collect();

        let failures = ui::print_summary("provision", "--from", &outcomes);
        if failures > 0 {
            bail!("Provisioning failed on {failures} host(s)");
        }
        ui::print_success("All hosts provisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_bands() {
        let group = ProgressGroup::new(actors()).unwrap();
        let bands: Vec<(f64, f64)> = group
            .actors()
            .iter()
            .map(|a| (a.baseline, a.ratio))
            .collect();
        assert_eq!(bands, vec![(0.0, 50.0), (50.0, 10.0), (60.0, 40.0)]);
    }

    #[test]
    fn test_every_stage_names_an_actor() {
        let group = ProgressGroup::new(actors()).unwrap();
        for stage in [Stage::Os, Stage::Reboot, Stage::Env] {
            assert!(group.resolve(&ActorRef::from(stage.actor())).is_ok());
        }
    }

    #[test]
    fn test_reboot_resume_needs_old_session() {
        assert!(check_resume(Stage::Reboot, None).is_err());
        assert!(check_resume(Stage::Reboot, Some("sess-1")).is_ok());
        assert!(check_resume(Stage::Os, None).is_ok());
        assert!(check_resume(Stage::Env, None).is_ok());
    }
}
