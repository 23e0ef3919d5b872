//! Weighted progress aggregation over a sequence of named actors.
//!
//! Each actor owns a band `[baseline, baseline + ratio]` of a single 0-100
//! scale. Real actors report numeric sub-progress which is scaled into their
//! band; fake actors get a synthesized `1 - e^(-t/τ)` curve that never reaches
//! the top of the band until the actor actually finishes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{classify_anyhow, Classify, ErrorKind};

const EPSILON: f64 = 1e-6;

/// Errors from building or running an actor group.
#[derive(Error, Debug)]
pub enum ProgressError {
    /// Ratios do not resolve to exactly 100.
    #[error("Invalid actor ratios: {0}")]
    InvalidRatios(String),

    /// Two actors share a name.
    #[error("Duplicate actor name '{0}'")]
    DuplicateActor(String),

    /// Resume target names no actor.
    #[error("Unknown actor {0}")]
    UnknownActor(String),

    /// Jobs do not line up with the actors.
    #[error("Expected {expected} actor jobs, got {actual}")]
    JobCountMismatch { expected: usize, actual: usize },

    /// An actor's job failed.
    #[error("Actor '{name}' failed: {source:#}")]
    ActorFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Classify for ProgressError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ActorFailed { source, .. } => classify_anyhow(source),
            _ => ErrorKind::Validation,
        }
    }
}

/// Whether an actor's numeric reports are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// Reports measured progress.
    Real,
    /// Progress is synthesized over time.
    Fake,
}

/// Lifecycle of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Declaration of one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    /// Unique name.
    pub name: String,
    /// Share of the 0-100 scale; omitted ratios split the remainder evenly.
    #[serde(default)]
    pub ratio: Option<f64>,
    /// Real or fake progress.
    pub kind: ActorKind,
    /// Message shown when the actor starts.
    #[serde(default)]
    pub init_message: Option<String>,
}

impl ActorSpec {
    /// A real-progress actor.
    pub fn real(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ratio: None,
            kind: ActorKind::Real,
            init_message: None,
        }
    }

    /// A fake-progress actor.
    pub fn fake(name: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Fake,
            ..Self::real(name)
        }
    }

    /// Set the ratio.
    #[must_use]
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = Some(ratio);
        self
    }

    /// Set the start message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.init_message = Some(message.into());
        self
    }
}

/// An actor with its band resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Actor {
    pub name: String,
    pub ratio: f64,
    pub baseline: f64,
    pub kind: ActorKind,
    pub status: ActorStatus,
    pub init_message: Option<String>,
}

/// One aggregated progress update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Overall progress, 0-100.
    pub percent: f64,
    /// Actor the update is about.
    pub actor: String,
    /// Actor status at the time of the update.
    pub status: ActorStatus,
    pub message: Option<String>,
}

/// Resume point for [`ProgressGroup::run_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRef {
    Name(String),
    Index(usize),
}

impl From<&str> for ActorRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<usize> for ActorRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Work done by one actor.
#[async_trait]
pub trait ActorJob: Send + Sync {
    /// Run to completion, reporting through `reporter`.
    async fn run(&self, reporter: Reporter) -> anyhow::Result<()>;
}

/// Shape of the synthesized curve for fake actors.
#[derive(Debug, Clone, Copy)]
pub struct FakeProgressSettings {
    /// Time constant τ.
    pub tau: Duration,
    /// Ticker period.
    pub tick: Duration,
    /// Fraction of the band the curve may reach before the actor finishes.
    pub cap: f64,
}

impl Default for FakeProgressSettings {
    fn default() -> Self {
        Self {
            tau: Duration::from_secs(30),
            tick: Duration::from_millis(500),
            cap: 0.95,
        }
    }
}

/// Fraction of a fake actor's band reached after `elapsed`.
fn fake_fraction(elapsed: Duration, settings: &FakeProgressSettings) -> f64 {
    let tau = settings.tau.as_secs_f64().max(EPSILON);
    (1.0 - (-elapsed.as_secs_f64() / tau).exp()).min(settings.cap)
}

#[derive(Debug)]
struct ReportState {
    percent: f64,
    closed: bool,
}

/// Handle given to a running actor.
#[derive(Clone)]
pub struct Reporter {
    actor: String,
    kind: ActorKind,
    baseline: f64,
    ratio: f64,
    state: Arc<Mutex<ReportState>>,
    sink: UnboundedSender<ProgressUpdate>,
}

impl Reporter {
    fn new(actor: &Actor, sink: &UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            actor: actor.name.clone(),
            kind: actor.kind,
            baseline: actor.baseline,
            ratio: actor.ratio,
            state: Arc::new(Mutex::new(ReportState {
                percent: actor.baseline,
                closed: false,
            })),
            sink: sink.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `percent` (if given) and send a running update. Updates are sent
    /// under the state lock, so nothing gets out after [`Self::close`].
    fn publish(&self, percent: Option<f64>, message: Option<String>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(percent) = percent {
            state.percent = percent;
        }
        let update = ProgressUpdate {
            percent: state.percent,
            actor: self.actor.clone(),
            status: ActorStatus::Running,
            message,
        };
        if self.sink.send(update).is_err() {
            debug!(actor = %self.actor, "Progress receiver dropped");
        }
    }

    /// Stop accepting reports. Returns the last reported percentage.
    fn close(&self) -> f64 {
        let mut state = self.lock();
        state.closed = true;
        state.percent
    }

    /// Current overall percentage.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.lock().percent
    }

    /// Report sub-progress (0-100) within this actor. Ignored for fake actors.
    pub fn progress(&self, sub_percent: f64) {
        self.progress_with(sub_percent, None);
    }

    /// Report sub-progress together with a message.
    pub fn progress_with(&self, sub_percent: f64, message: Option<String>) {
        if self.kind == ActorKind::Fake {
            if message.is_some() {
                self.publish(None, message);
            }
            return;
        }
        let percent = self.baseline + self.ratio * sub_percent.clamp(0.0, 100.0) / 100.0;
        self.publish(Some(percent), message);
    }

    /// Change the message without moving progress.
    pub fn message(&self, message: impl Into<String>) {
        self.publish(None, Some(message.into()));
    }
}

fn spawn_ticker(reporter: Reporter, settings: FakeProgressSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut interval = tokio::time::interval(settings.tick);
        interval.tick().await;
        loop {
            interval.tick().await;
            let percent = reporter.baseline
                + reporter.ratio * fake_fraction(start.elapsed(), &settings);
            reporter.publish(Some(percent), None);
        }
    })
}

/// A validated, ordered set of actors sharing one 0-100 scale.
#[derive(Debug, Clone)]
pub struct ProgressGroup {
    actors: Vec<Actor>,
    fake: FakeProgressSettings,
}

impl ProgressGroup {
    /// Validate ratios and resolve every actor's band.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::InvalidRatios`] if ratios exceed 100, leave
    /// nothing for actors without one, or do not total exactly 100.
    pub fn new(specs: Vec<ActorSpec>) -> Result<Self, ProgressError> {
        if specs.is_empty() {
            return Err(ProgressError::InvalidRatios("no actors".into()));
        }

        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(ProgressError::DuplicateActor(spec.name.clone()));
            }
            if let Some(r) = spec.ratio {
                if !(0.0..=100.0).contains(&r) {
                    return Err(ProgressError::InvalidRatios(format!(
                        "ratio {r} of '{}' is outside 0..=100",
                        spec.name
                    )));
                }
            }
        }

        let declared: f64 = specs.iter().filter_map(|s| s.ratio).sum();
        if declared > 100.0 + EPSILON {
            return Err(ProgressError::InvalidRatios(format!(
                "declared ratios sum to {declared}"
            )));
        }

        let unset = specs.iter().filter(|s| s.ratio.is_none()).count();
        let share = if unset == 0 {
            if (declared - 100.0).abs() > EPSILON {
                return Err(ProgressError::InvalidRatios(format!(
                    "ratios sum to {declared}, expected 100"
                )));
            }
            0.0
        } else {
            let rest = 100.0 - declared;
            if rest <= EPSILON {
                return Err(ProgressError::InvalidRatios(format!(
                    "nothing left for {unset} actor(s) without a ratio"
                )));
            }
            #[allow(clippy::cast_precision_loss)]
            let share = rest / unset as f64;
            share
        };

        let mut baseline = 0.0;
        let actors = specs
            .into_iter()
            .map(|spec| {
                let ratio = spec.ratio.unwrap_or(share);
                let actor = Actor {
                    name: spec.name,
                    ratio,
                    baseline,
                    kind: spec.kind,
                    status: ActorStatus::Idle,
                    init_message: spec.init_message,
                };
                baseline += ratio;
                actor
            })
            .collect();

        Ok(Self {
            actors,
            fake: FakeProgressSettings::default(),
        })
    }

    /// Override the fake progress curve.
    #[must_use]
    pub fn with_fake_settings(mut self, settings: FakeProgressSettings) -> Self {
        self.fake = settings;
        self
    }

    /// Resolved actors in order.
    #[must_use]
    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    /// Index of `actor`.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::UnknownActor`] if it does not resolve.
    pub fn resolve(&self, actor: &ActorRef) -> Result<usize, ProgressError> {
        match actor {
            ActorRef::Name(name) => self
                .actors
                .iter()
                .position(|a| &a.name == name)
                .ok_or_else(|| ProgressError::UnknownActor(format!("'{name}'"))),
            ActorRef::Index(i) if *i < self.actors.len() => Ok(*i),
            ActorRef::Index(i) => Err(ProgressError::UnknownActor(format!("#{i}"))),
        }
    }

    /// Run every actor in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::ActorFailed`] for the first failing actor.
    pub async fn run(
        &mut self,
        jobs: &[Arc<dyn ActorJob>],
        sink: &UnboundedSender<ProgressUpdate>,
    ) -> Result<(), ProgressError> {
        self.run_from(ActorRef::Index(0), jobs, sink).await
    }

    /// Run actors starting at `from`. `jobs` lines up with [`Self::actors`].
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::UnknownActor`] or
    /// [`ProgressError::JobCountMismatch`] before running anything, otherwise
    /// [`ProgressError::ActorFailed`] for the first failing actor.
    pub async fn run_from(
        &mut self,
        from: ActorRef,
        jobs: &[Arc<dyn ActorJob>],
        sink: &UnboundedSender<ProgressUpdate>,
    ) -> Result<(), ProgressError> {
        if jobs.len() != self.actors.len() {
            return Err(ProgressError::JobCountMismatch {
                expected: self.actors.len(),
                actual: jobs.len(),
            });
        }
        let start = self.resolve(&from)?;

        for index in start..self.actors.len() {
            self.run_actor(index, jobs[index].as_ref(), sink).await?;
        }
        Ok(())
    }

    async fn run_actor(
        &mut self,
        index: usize,
        job: &dyn ActorJob,
        sink: &UnboundedSender<ProgressUpdate>,
    ) -> Result<(), ProgressError> {
        let fake = self.fake;
        let actor = &mut self.actors[index];
        actor.status = ActorStatus::Running;
        info!(actor = %actor.name, baseline = actor.baseline, ratio = actor.ratio, "Actor started");

        let reporter = Reporter::new(actor, sink);
        reporter.publish(None, actor.init_message.clone());

        let ticker = (actor.kind == ActorKind::Fake).then(|| spawn_ticker(reporter.clone(), fake));
        let result = job.run(reporter.clone()).await;
        if let Some(ticker) = ticker {
            ticker.abort();
            let _ = ticker.await;
        }
        // Jobs may leak reporter clones into tasks of their own.
        let last = reporter.close();

        let (status, percent, message) = match &result {
            Ok(()) => (ActorStatus::Done, actor.baseline + actor.ratio, None),
            Err(e) => (ActorStatus::Error, last, Some(format!("{e:#}"))),
        };
        actor.status = status;
        let _ = sink.send(ProgressUpdate {
            percent,
            actor: actor.name.clone(),
            status,
            message,
        });

        result.map_err(|source| {
            error!(actor = %actor.name, error = %source, "Actor failed");
            ProgressError::ActorFailed {
                name: actor.name.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Steps(Vec<f64>);

    #[async_trait]
    impl ActorJob for Steps {
        async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
            for p in &self.0 {
                reporter.progress(*p);
            }
            Ok(())
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl ActorJob for Sleep {
        async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
            reporter.progress(90.0);
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl ActorJob for Fails {
        async fn run(&self, _reporter: Reporter) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    #[test]
    fn test_missing_ratio_takes_remainder() {
        let group = ProgressGroup::new(vec![
            ActorSpec::real("x").with_ratio(40.0),
            ActorSpec::real("y"),
        ])
        .unwrap();
        let y = &group.actors()[1];
        assert!((y.ratio - 60.0).abs() < EPSILON);
        assert!((y.baseline - 40.0).abs() < EPSILON);
    }

    #[test]
    fn test_ratios_over_100_rejected() {
        let err = ProgressGroup::new(vec![
            ActorSpec::real("a").with_ratio(60.0),
            ActorSpec::real("b").with_ratio(50.0),
        ])
        .unwrap_err();
        assert!(matches!(err, ProgressError::InvalidRatios(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_ratios_must_total_100() {
        assert!(ProgressGroup::new(vec![ActorSpec::real("a").with_ratio(70.0)]).is_err());
        assert!(ProgressGroup::new(vec![
            ActorSpec::real("a").with_ratio(100.0),
            ActorSpec::fake("b"),
        ])
        .is_err());
        assert!(matches!(
            ProgressGroup::new(vec![ActorSpec::real("a"), ActorSpec::real("a")]),
            Err(ProgressError::DuplicateActor(_))
        ));

        let even = ProgressGroup::new(vec![
            ActorSpec::real("a"),
            ActorSpec::real("b"),
            ActorSpec::real("c"),
        ])
        .unwrap();
        let total: f64 = even.actors().iter().map(|a| a.ratio).sum();
        assert!((total - 100.0).abs() < EPSILON);
    }

    #[tokio::test]
    async fn test_real_progress_scaled_into_band() {
        let mut group = ProgressGroup::new(vec![
            ActorSpec::real("os").with_ratio(40.0).with_message("Installing OS"),
            ActorSpec::real("env"),
        ])
        .unwrap();
        let jobs: Vec<Arc<dyn ActorJob>> =
            vec![Arc::new(Steps(vec![50.0])), Arc::new(Steps(vec![50.0, 100.0]))];
        let (tx, mut rx) = mpsc::unbounded_channel();

        group.run(&jobs, &tx).await.unwrap();

        let percents: Vec<f64> = drain(&mut rx).iter().map(|u| u.percent).collect();
        assert_eq!(percents, vec![0.0, 20.0, 40.0, 40.0, 70.0, 100.0, 100.0]);
        assert!(group.actors().iter().all(|a| a.status == ActorStatus::Done));
    }

    #[tokio::test]
    async fn test_failure_marks_actor_error() {
        let mut group = ProgressGroup::new(vec![
            ActorSpec::real("a").with_ratio(50.0),
            ActorSpec::real("b"),
        ])
        .unwrap();
        let jobs: Vec<Arc<dyn ActorJob>> = vec![Arc::new(Fails), Arc::new(Steps(vec![]))];
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = group.run(&jobs, &tx).await.unwrap_err();
        assert!(matches!(err, ProgressError::ActorFailed { ref name, .. } if name == "a"));
        assert_eq!(group.actors()[0].status, ActorStatus::Error);
        assert_eq!(group.actors()[1].status, ActorStatus::Idle);

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.status, ActorStatus::Error);
        assert!(last.message.unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_run_from_skips_earlier_actors() {
        let mut group = ProgressGroup::new(vec![
            ActorSpec::real("a").with_ratio(50.0),
            ActorSpec::real("b"),
        ])
        .unwrap();
        let jobs: Vec<Arc<dyn ActorJob>> = vec![Arc::new(Fails), Arc::new(Steps(vec![]))];
        let (tx, mut rx) = mpsc::unbounded_channel();

        group.run_from("b".into(), &jobs, &tx).await.unwrap();
        let updates = drain(&mut rx);
        assert!(updates.iter().all(|u| u.actor == "b"));
        assert!((updates[0].percent - 50.0).abs() < EPSILON);

        assert!(matches!(
            group.run_from(ActorRef::Index(7), &jobs, &tx).await,
            Err(ProgressError::UnknownActor(_))
        ));
        assert!(matches!(
            group.run(&jobs[..1], &tx).await,
            Err(ProgressError::JobCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_progress_stays_below_band_top() {
        let mut group = ProgressGroup::new(vec![
            ActorSpec::real("prep").with_ratio(20.0),
            ActorSpec::fake("reboot"),
        ])
        .unwrap()
        .with_fake_settings(FakeProgressSettings {
            tau: Duration::from_secs(2),
            tick: Duration::from_secs(1),
            cap: 0.95,
        });
        let jobs: Vec<Arc<dyn ActorJob>> = vec![
            Arc::new(Steps(vec![])),
            Arc::new(Sleep(Duration::from_secs(20))),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();

        group.run(&jobs, &tx).await.unwrap();

        let ticks: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter(|u| u.actor == "reboot" && u.status == ActorStatus::Running)
            .map(|u| u.percent)
            .collect();
        // Start update, then the ticker; the numeric report of 90 is ignored.
        assert!(ticks.len() > 5);
        assert!(ticks.windows(2).all(|w| w[1] >= w[0]));
        assert!(ticks.iter().all(|p| *p >= 20.0 && *p <= 20.0 + 80.0 * 0.95 + EPSILON));
        assert!(ticks.last().unwrap() > &90.0);
    }

    struct Chatty;

    #[async_trait]
    impl ActorJob for Chatty {
        async fn run(&self, reporter: Reporter) -> anyhow::Result<()> {
            let until = Instant::now() + Duration::from_millis(40);
            tokio::spawn(async move {
                let mut i = 0u32;
                while Instant::now() < until {
                    reporter.progress(f64::from(i % 100));
                    i += 1;
                    tokio::task::yield_now().await;
                }
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nothing_reported_after_done() {
        for _ in 0..20 {
            let mut group = ProgressGroup::new(vec![
                ActorSpec::fake("reboot").with_ratio(50.0),
                ActorSpec::real("chatty"),
            ])
            .unwrap()
            .with_fake_settings(FakeProgressSettings {
                tau: Duration::from_millis(50),
                tick: Duration::from_millis(1),
                cap: 0.95,
            });
            let jobs: Vec<Arc<dyn ActorJob>> = vec![
                Arc::new(Sleep(Duration::from_millis(25))),
                Arc::new(Chatty),
            ];
            let (tx, mut rx) = mpsc::unbounded_channel();

            group.run(&jobs, &tx).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let updates = drain(&mut rx);

            let reboot: Vec<&ProgressUpdate> =
                updates.iter().filter(|u| u.actor == "reboot").collect();
            assert_eq!(reboot.last().unwrap().status, ActorStatus::Done);
            assert!(reboot.windows(2).all(|w| w[1].percent >= w[0].percent));

            let chatty: Vec<&ProgressUpdate> =
                updates.iter().filter(|u| u.actor == "chatty").collect();
            assert_eq!(chatty.last().unwrap().status, ActorStatus::Done);
            assert_eq!(
                chatty.iter().filter(|u| u.status == ActorStatus::Done).count(),
                1
            );
        }
    }

    #[test]
    fn test_fake_curve_is_capped() {
        let settings = FakeProgressSettings {
            tau: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            cap: 0.9,
        };
        assert!(fake_fraction(Duration::ZERO, &settings).abs() < EPSILON);
        let at_tau = fake_fraction(Duration::from_secs(10), &settings);
        assert!((at_tau - (1.0 - (-1.0f64).exp())).abs() < 1e-9);
        assert!((fake_fraction(Duration::from_secs(1000), &settings) - 0.9).abs() < EPSILON);
    }
}
