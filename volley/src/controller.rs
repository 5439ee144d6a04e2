//! Lifecycle of a single run.
//!
//! ```text
//! Pending -> Ramping -> Draining -> Completed
//!               \           \
//!                `-----------`--> Aborted
//! ```
//!
//! [`RunController::run`] walks the state machine once. Dispatch ends when the
//! schedule is exhausted, a stop is requested through a [`RunHandle`], or an
//! abort-on-fail threshold trips. In every case the pool refuses new slots
//! from that point on and in-flight iterations get `gracefulStop` to finish
//! before they are interrupted.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, marker::PhantomData, pin::pin, sync::Arc};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    clock::{Clock, TokioClock},
    config::{RunConfig, RunPlan},
    dispatcher::{Dispatcher, Iteration},
    error::{BoxError, ConfigError, Error},
    metrics::{MetricsAggregator, MetricsSnapshot},
    pool::WorkerPool,
    report::{Reporter, RunSummary},
    threshold::{run_evaluator, ThresholdEvaluator},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Configuration validated, pool warm, nothing dispatched yet
    Pending,
    /// Dispatching per the schedule
    Ramping,
    /// No new starts, waiting for in-flight iterations
    Draining,
    Completed,
    /// Stopped early by an abort-on-fail threshold
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Ramping => 1,
            Self::Draining => 2,
            Self::Completed | Self::Aborted => 3,
        }
    }

    /// Transitions only move forward.
    pub fn can_advance_to(self, next: Self) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Ramping) | (Ramping, Draining) | (Ramping, Aborted) | (Draining, Completed) | (Draining, Aborted)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ramping => "ramping",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

fn advance(state: &watch::Sender<RunState>, next: RunState) {
    state.send_if_modified(|current| {
        if !current.can_advance_to(next) {
            tracing::debug!("Ignoring transition {current} -> {next}");
            return false;
        }
        tracing::info!("Run state: {current} -> {next}");
        *current = next;
        true
    });
}

/// Observe and steer a run from outside [`RunController::run`].
#[derive(Clone)]
pub struct RunHandle<C = TokioClock> {
    state: watch::Receiver<RunState>,
    stop: CancellationToken,
    metrics: Arc<MetricsAggregator>,
    clock: C,
}

impl<C: Clock> RunHandle<C> {
    /// End dispatch early. In-flight iterations still drain and the run
    /// completes normally.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Resolve once the run has reached `target` or any state after it, and
    /// return the state actually reached.
    ///
    /// `Completed` and `Aborted` are both final, so waiting for either one
    /// resolves on whichever the run ends in. Check the returned state to
    /// tell them apart.
    pub async fn wait_for(&self, target: RunState) -> RunState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| s.rank() >= target.rank()).await.map(|s| *s);
        // the controller is gone, so its last state is final
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    /// Live view of the metrics, with `elapsed` read from the run's clock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot_at(self.clock.now())
    }
}

/// Runs one validated plan against one iteration callback.
pub struct RunController<F, Fut, C = TokioClock> {
    plan: RunPlan,
    action: F,
    clock: C,
    metrics: Arc<MetricsAggregator>,
    state: watch::Sender<RunState>,
    stop: CancellationToken,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> RunController<F, Fut, TokioClock>
where
    F: Fn(Iteration) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    /// Validate `config` and prepare a run. Nothing is dispatched until
    /// [`run`](Self::run) is awaited.
    pub fn new(config: &RunConfig, action: F) -> Result<Self, ConfigError> {
        Self::with_clock(config, action, TokioClock)
    }
}

impl<F, Fut, C> RunController<F, Fut, C>
where
    F: Fn(Iteration) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    C: Clock,
{
    pub fn with_clock(config: &RunConfig, action: F, clock: C) -> Result<Self, ConfigError> {
        Ok(Self::from_plan(config.validate()?, action, clock))
    }

    pub fn from_plan(plan: RunPlan, action: F, clock: C) -> Self {
        let metrics = Arc::new(MetricsAggregator::new(plan.metric_shards));
        let (state, _) = watch::channel(RunState::Pending);
        Self {
            plan,
            action,
            clock,
            metrics,
            state,
            stop: CancellationToken::new(),
            _fut: PhantomData,
        }
    }

    pub fn handle(&self) -> RunHandle<C> {
        RunHandle {
            state: self.state.subscribe(),
            stop: self.stop.clone(),
            metrics: Arc::clone(&self.metrics),
            clock: self.clock.clone(),
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Drive the run to a terminal state and return its summary.
    pub async fn run(self) -> RunSummary {
        let Self {
            plan,
            action,
            clock,
            metrics,
            state,
            stop,
            ..
        } = self;

        let started_at = Utc::now();
        metrics.start_at(clock.now());
        tracing::info!("Starting run {}", plan.name);

        let pool = WorkerPool::new(plan.pool);
        let tracker = TaskTracker::new();
        let interrupt = CancellationToken::new();
        let abort = CancellationToken::new();
        let eval_done = CancellationToken::new();

        let evaluator = tokio::spawn(run_evaluator(
            ThresholdEvaluator::new(plan.thresholds.clone()),
            Arc::clone(&metrics),
            clock.clone(),
            plan.evaluation_period,
            abort.clone(),
            eval_done.clone(),
        ));

        let mut dispatcher = Dispatcher::builder()
            .schedule(Arc::clone(&plan.schedule))
            .pool(pool.clone())
            .metrics(Arc::clone(&metrics))
            .action(action)
            .settings(plan.iteration)
            .tick(plan.tick)
            .tracker(tracker.clone())
            .interrupt(interrupt.clone())
            .build();

        advance(&state, RunState::Ramping);
        let mut aborted = tokio::select! {
            biased;
            _ = abort.cancelled() => true,
            _ = stop.cancelled() => {
                tracing::info!("Stop requested, ending dispatch early");
                false
            }
            _ = dispatcher.run(&clock) => false,
        };
        drop(dispatcher);
        pool.close();
        tracker.close();

        advance(&state, if aborted { RunState::Aborted } else { RunState::Draining });
        if !tracker.is_empty() {
            tracing::info!(
                "Waiting up to {:?} for {} in-flight iterations",
                plan.graceful_stop,
                tracker.len()
            );
        }

        let mut grace = pin!(clock.sleep(plan.graceful_stop));
        loop {
            tokio::select! {
                biased;
                _ = tracker.wait() => break,
                _ = abort.cancelled(), if !aborted => {
                    aborted = true;
                    advance(&state, RunState::Aborted);
                }
                _ = &mut grace => {
                    tracing::warn!(
                        "Graceful stop of {:?} elapsed, interrupting {} iterations",
                        plan.graceful_stop,
                        tracker.len()
                    );
                    interrupt.cancel();
                    tracker.wait().await;
                    break;
                }
            }
        }

        eval_done.cancel();
        let mut evaluator = match evaluator.await {
            Ok(evaluator) => evaluator,
            Err(e) => {
                tracing::error!("Threshold evaluator failed: {e}");
                ThresholdEvaluator::new(plan.thresholds.clone())
            }
        };
        // the evaluator may have tripped after the drain finished
        if abort.is_cancelled() && !aborted {
            aborted = true;
            advance(&state, RunState::Aborted);
        }

        let snapshot = metrics.snapshot_at(clock.now());
        let thresholds = evaluator.finalize(&snapshot);
        if !aborted {
            advance(&state, RunState::Completed);
        }
        for failed in thresholds.iter().filter(|t| !t.passed) {
            tracing::warn!("Threshold {}: {} failed", failed.metric, failed.expression);
        }

        let summary = RunSummary {
            name: plan.name,
            started_at,
            ended_at: Utc::now(),
            state: *state.borrow(),
            abort_causes: evaluator.abort_causes().to_vec(),
            thresholds,
            peak_vus: pool.peak(),
            allocated_vus: pool.allocated(),
            snapshot,
        };
        tracing::info!(
            "Run {} {}: {} started, {} completed, {} dropped",
            summary.name,
            summary.state,
            summary.snapshot.total_started,
            summary.snapshot.total_completed,
            summary.snapshot.dropped_count
        );
        summary
    }

    /// [`run`](Self::run), then hand the summary to `reporter`.
    pub async fn run_and_report<R: Reporter>(self, reporter: &R) -> Result<RunSummary, Error> {
        let summary = self.run().await;
        reporter.report(&summary).await.map_err(Error::Report)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use RunState::*;
        assert!(Pending.can_advance_to(Ramping));
        assert!(Ramping.can_advance_to(Aborted));
        assert!(Draining.can_advance_to(Aborted));
        assert!(!Ramping.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(Draining));
        assert!(!Draining.can_advance_to(Ramping));
        assert!(!Pending.can_advance_to(Pending));
    }

    #[test]
    fn advance_ignores_illegal_transitions() {
        let (tx, rx) = watch::channel(RunState::Pending);
        advance(&tx, RunState::Draining);
        assert_eq!(*rx.borrow(), RunState::Pending);
        advance(&tx, RunState::Ramping);
        advance(&tx, RunState::Aborted);
        advance(&tx, RunState::Completed);
        assert_eq!(*rx.borrow(), RunState::Aborted);
    }
}
