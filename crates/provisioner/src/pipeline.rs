//! Resumable step pipelines.
//!
//! A pipeline is an ordered table of `{step, target_progress, executor}`.
//! Running it emits a [`ProgressEvent::Running`] before each executor and a
//! single [`ProgressEvent::Failed`] carrying the step to resume from when one
//! fails. Both the OS install and the driver install flows are instances.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::error::{classify_anyhow, Classify, ErrorKind};

/// Errors from building or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Resume target does not name a configured step.
    #[error("Unknown step '{name}' in {stage} pipeline")]
    UnknownStep { stage: String, name: String },

    /// Resume index past the end of the table.
    #[error("Step index {index} out of range for {stage} pipeline with {len} steps")]
    IndexOutOfRange {
        stage: String,
        index: usize,
        len: usize,
    },

    /// Step table is empty, decreasing or above 100.
    #[error("Invalid progress table for {stage} pipeline: {reason}")]
    InvalidProgress { stage: String, reason: String },

    /// An executor failed.
    #[error("{stage} step '{step}' failed on host {host}: {source:#}")]
    StepFailed {
        stage: String,
        host: String,
        step: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Step to resume from, for failures.
    #[must_use]
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::StepFailed { source, .. } => classify_anyhow(source),
            Self::UnknownStep { .. } | Self::IndexOutOfRange { .. } | Self::InvalidProgress { .. } => {
                ErrorKind::Validation
            }
        }
    }
}

/// Identifier of one step of a pipeline kind.
pub trait PipelineStep: Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Stable name used for resume-by-name.
    fn name(&self) -> &str;
}

/// Work performed by one step against a context `C`.
#[async_trait]
pub trait StepExecutor<C>: Send + Sync {
    /// Run the step.
    async fn execute(&self, ctx: &C) -> anyhow::Result<()>;
}

/// Adapter turning a plain `fn` into a [`StepExecutor`].
pub struct StepFn<C: 'static>(pub for<'a> fn(&'a C) -> BoxFuture<'a, anyhow::Result<()>>);

#[async_trait]
impl<C: Send + Sync + 'static> StepExecutor<C> for StepFn<C> {
    async fn execute(&self, ctx: &C) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// One row of a step table.
pub struct StepConfig<S, C> {
    /// Step identifier.
    pub step: S,
    /// Cumulative progress once this step is done.
    pub target_progress: u8,
    /// What the step does.
    pub executor: Arc<dyn StepExecutor<C>>,
}

impl<S: Clone, C> Clone for StepConfig<S, C> {
    fn clone(&self) -> Self {
        Self {
            step: self.step.clone(),
            target_progress: self.target_progress,
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<S: fmt::Debug, C> fmt::Debug for StepConfig<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepConfig")
            .field("step", &self.step)
            .field("target_progress", &self.target_progress)
            .finish_non_exhaustive()
    }
}

/// Progress of one host through one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent<S> {
    /// `started_step` is about to run; progress moves from `from` towards `to`.
    Running {
        stage: String,
        host: String,
        from: u8,
        to: u8,
        completed_step: Option<S>,
        started_step: S,
    },
    /// `step` failed; resume from it.
    Failed {
        stage: String,
        host: String,
        from: u8,
        to: u8,
        step: S,
        error: String,
    },
    /// Every step succeeded. Sent once after the last step, which no
    /// `Running` event reports as completed.
    Finished {
        stage: String,
        host: String,
        completed_step: S,
    },
}

impl<S> ProgressEvent<S> {
    /// Host the event belongs to.
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Running { host, .. } | Self::Failed { host, .. } | Self::Finished { host, .. } => {
                host
            }
        }
    }

    /// Upper progress bound carried by the event.
    #[must_use]
    pub fn to(&self) -> u8 {
        match self {
            Self::Running { to, .. } | Self::Failed { to, .. } => *to,
            Self::Finished { .. } => 100,
        }
    }
}

/// An ordered, validated step table.
pub struct Pipeline<S, C> {
    stage: String,
    steps: Vec<StepConfig<S, C>>,
}

impl<S, C> fmt::Debug for Pipeline<S, C>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stage", &self.stage)
            .field("steps", &self.steps)
            .finish()
    }
}

impl<S, C> Pipeline<S, C>
where
    S: PipelineStep,
    C: Send + Sync,
{
    /// Build a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidProgress`] if the table is empty, a
    /// target exceeds 100, or targets decrease.
    pub fn new(stage: impl Into<String>, steps: Vec<StepConfig<S, C>>) -> Result<Self, PipelineError> {
        let stage = stage.into();
        let invalid = |reason: String| PipelineError::InvalidProgress {
            stage: stage.clone(),
            reason,
        };

        if steps.is_empty() {
            return Err(invalid("no steps".into()));
        }
        let mut previous = 0u8;
        for config in &steps {
            if config.target_progress > 100 {
                return Err(invalid(format!(
                    "step '{}' targets {}%",
                    config.step.name(),
                    config.target_progress
                )));
            }
            if config.target_progress < previous {
                return Err(invalid(format!(
                    "step '{}' targets {}% after {}%",
                    config.step.name(),
                    config.target_progress,
                    previous
                )));
            }
            previous = config.target_progress;
        }

        Ok(Self { stage, steps })
    }

    /// Pipeline stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Step table.
    #[must_use]
    pub fn steps(&self) -> &[StepConfig<S, C>] {
        &self.steps
    }

    /// Index of the first step named `name`.
    #[must_use]
    pub fn find_step(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|c| c.step.name() == name)
    }

    /// Run from the step named `name`, or from the start when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownStep`] before doing anything if the name
    /// is not configured, otherwise as [`Self::run`].
    pub async fn run_from_step(
        &self,
        host: &str,
        ctx: &C,
        name: Option<&str>,
        sink: &UnboundedSender<ProgressEvent<S>>,
    ) -> Result<(), PipelineError> {
        let index = match name {
            None => 0,
            Some(name) => self.find_step(name).ok_or_else(|| PipelineError::UnknownStep {
                stage: self.stage.clone(),
                name: name.to_string(),
            })?,
        };
        self.run(host, ctx, index, sink).await
    }

    /// Run steps `from_index..` in order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StepFailed`] for the first failing step after
    /// emitting its `Failed` event.
    pub async fn run(
        &self,
        host: &str,
        ctx: &C,
        from_index: usize,
        sink: &UnboundedSender<ProgressEvent<S>>,
    ) -> Result<(), PipelineError> {
        if from_index >= self.steps.len() {
            return Err(PipelineError::IndexOutOfRange {
                stage: self.stage.clone(),
                index: from_index,
                len: self.steps.len(),
            });
        }

        info!(stage = %self.stage, host = %host, from_step = %self.steps[from_index].step, "Pipeline started");

        for i in from_index..self.steps.len() {
            let current = &self.steps[i];
            let previous = i.checked_sub(1).map(|p| &self.steps[p]);
            let from = previous.map_or(0, |p| p.target_progress);
            let to = current.target_progress;

            // A closed receiver only means nobody is watching.
            let _ = sink.send(ProgressEvent::Running {
                stage: self.stage.clone(),
                host: host.to_string(),
                from,
                to,
                completed_step: previous.map(|p| p.step.clone()),
                started_step: current.step.clone(),
            });
            debug!(stage = %self.stage, host = %host, step = %current.step, from, to, "Step started");

            if let Err(e) = current.executor.execute(ctx).await {
                error!(stage = %self.stage, host = %host, step = %current.step, error = %format!("{e:#}"), "Step failed");
                let _ = sink.send(ProgressEvent::Failed {
                    stage: self.stage.clone(),
                    host: host.to_string(),
                    from,
                    to,
                    step: current.step.clone(),
                    error: format!("{e:#}"),
                });
                return Err(PipelineError::StepFailed {
                    stage: self.stage.clone(),
                    host: host.to_string(),
                    step: current.step.name().to_string(),
                    source: e,
                });
            }
        }

        if let Some(last) = self.steps.last() {
            let _ = sink.send(ProgressEvent::Finished {
                stage: self.stage.clone(),
                host: host.to_string(),
                completed_step: last.step.clone(),
            });
        }
        info!(stage = %self.stage, host = %host, "Pipeline finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        A,
        B,
        C,
    }

    impl PipelineStep for Step {
        fn name(&self) -> &str {
            match self {
                Self::A => "a",
                Self::B => "b",
                Self::C => "c",
            }
        }
    }

    impl fmt::Display for Step {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    #[derive(Default)]
    struct Ctx {
        calls: Mutex<Vec<&'static str>>,
        fail_on: Option<&'static str>,
    }

    struct Record(&'static str);

    #[async_trait]
    impl StepExecutor<Ctx> for Record {
        async fn execute(&self, ctx: &Ctx) -> anyhow::Result<()> {
            ctx.calls.lock().unwrap().push(self.0);
            if ctx.fail_on == Some(self.0) {
                anyhow::bail!("{} exploded", self.0);
            }
            Ok(())
        }
    }

    fn abc() -> Pipeline<Step, Ctx> {
        let row = |step, target, name| StepConfig {
            step,
            target_progress: target,
            executor: Arc::new(Record(name)) as Arc<dyn StepExecutor<Ctx>>,
        };
        Pipeline::new(
            "test",
            vec![row(Step::A, 30, "a"), row(Step::B, 70, "b"), row(Step::C, 100, "c")],
        )
        .unwrap()
    }

    async fn collect(
        pipeline: &Pipeline<Step, Ctx>,
        ctx: &Ctx,
        name: Option<&str>,
    ) -> (Result<(), PipelineError>, Vec<ProgressEvent<Step>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = pipeline.run_from_step("h1", ctx, name, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (result, events)
    }

    fn running(from: u8, to: u8, completed: Option<Step>, started: Step) -> ProgressEvent<Step> {
        ProgressEvent::Running {
            stage: "test".into(),
            host: "h1".into(),
            from,
            to,
            completed_step: completed,
            started_step: started,
        }
    }

    #[tokio::test]
    async fn test_resume_from_named_step() {
        let ctx = Ctx::default();
        let (result, events) = collect(&abc(), &ctx, Some("b")).await;
        result.unwrap();

        assert_eq!(events[0], running(30, 70, Some(Step::A), Step::B));
        assert_eq!(events[1], running(70, 100, Some(Step::B), Step::C));
        assert!(matches!(events[2], ProgressEvent::Finished { completed_step: Step::C, .. }));
        assert_eq!(*ctx.calls.lock().unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_resume_matches_full_run_suffix() {
        let pipeline = abc();
        let (_, full) = collect(&pipeline, &Ctx::default(), None).await;

        for i in 0..pipeline.steps().len() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            pipeline.run("h1", &Ctx::default(), i, &tx).await.unwrap();
            drop(tx);
            let mut resumed = Vec::new();
            while let Some(e) = rx.recv().await {
                resumed.push(e);
            }
            assert_eq!(resumed[..], full[i..], "resume from {i}");
        }
    }

    #[tokio::test]
    async fn test_to_is_non_decreasing() {
        let (_, events) = collect(&abc(), &Ctx::default(), None).await;
        let tos: Vec<u8> = events.iter().map(ProgressEvent::to).collect();
        assert!(tos.windows(2).all(|w| w[0] <= w[1]), "{tos:?}");
    }

    #[tokio::test]
    async fn test_failure_emits_one_failed_event_and_stops() {
        let ctx = Ctx {
            fail_on: Some("b"),
            ..Ctx::default()
        };
        let (result, events) = collect(&abc(), &ctx, None).await;

        let err = result.unwrap_err();
        assert_eq!(err.failed_step(), Some("b"));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(events.len(), 3);
        match &events[2] {
            ProgressEvent::Failed { from, to, step, error, .. } => {
                assert_eq!((*from, *to, *step), (30, 70, Step::B));
                assert!(error.contains("b exploded"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(*ctx.calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_step_has_no_side_effects() {
        let ctx = Ctx::default();
        let pipeline = abc();
        assert_eq!(pipeline.find_step("zzz"), None);

        let (result, events) = collect(&pipeline, &ctx, Some("zzz")).await;
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep { ref name, .. } if name == "zzz"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(events.is_empty());
        assert!(ctx.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_fail_run() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        abc().run("h1", &Ctx::default(), 0, &tx).await.unwrap();
    }

    #[test]
    fn test_decreasing_progress_rejected() {
        let row = |step, target| StepConfig {
            step,
            target_progress: target,
            executor: Arc::new(Record("x")) as Arc<dyn StepExecutor<Ctx>>,
        };
        let err = Pipeline::new("bad", vec![row(Step::A, 50), row(Step::B, 40)]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidProgress { .. }));

        let err = Pipeline::new("bad", vec![row(Step::A, 101)]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidProgress { .. }));

        assert!(Pipeline::<Step, Ctx>::new("bad", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_step_fn_adapter() {
        fn mark(ctx: &Ctx) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                ctx.calls.lock().unwrap().push("fn");
                Ok(())
            })
        }
        let pipeline = Pipeline::new(
            "fn",
            vec![StepConfig {
                step: Step::A,
                target_progress: 100,
                executor: Arc::new(StepFn(mark)) as Arc<dyn StepExecutor<Ctx>>,
            }],
        )
        .unwrap();
        let ctx = Ctx::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        pipeline.run("h1", &ctx, 0, &tx).await.unwrap();
        assert_eq!(*ctx.calls.lock().unwrap(), vec!["fn"]);
    }
}
