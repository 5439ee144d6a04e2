//! The scheduling core: open-model arrival dispatch.
//!
//! The dispatcher separates **rate generation** from **work execution**. On
//! every tick it computes how many iterations the [`RateSchedule`] says should
//! have *started* since the previous tick, takes that many slots from the
//! [`WorkerPool`] and spawns one task per slot. It never waits for an iteration
//! to finish, so slow responses cannot throttle the arrival rate.
//!
//! # Tick math
//! For a tick covering `[t_prev, t]`:
//!
//! ```text
//! due_f     = integral of r(x) dx over [t_prev, t]   (trapezoidal, exact for linear r)
//! due       = floor(due_f + fractional)
//! fractional = (due_f + fractional) - due
//! ```
//!
//! Carrying `fractional` across ticks preserves the long-run average rate even
//! when a single tick is worth less than one iteration.
//!
//! # Failure handling
//! - A start that finds the pool saturated is counted as **dropped**.
//! - Callback errors and panics are recorded as failed outcomes inside the task.
//! - An iteration running past the per-iteration timeout is recorded as a timeout.
//! - When `interrupt` fires (graceful-stop deadline) every running iteration is
//!   abandoned and recorded as interrupted.
//!
//! Timeouts, pacing and iteration durations are measured on the same
//! [`Clock`] that drives the ticks.
use futures::FutureExt;
use std::{future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use typed_builder::TypedBuilder;

use crate::{
    clock::Clock,
    error::BoxError,
    metrics::{IterationOutcome, MetricsAggregator, StatusCategory},
    pool::{VuSlot, WorkerPool},
    schedule::RateSchedule,
};

/// Absorbs float error so an exact integer integral is not floored one short.
const EPSILON: f64 = 1e-9;

/// Handle passed to the iteration callback.
pub struct Iteration {
    vu: u64,
    metrics: Arc<MetricsAggregator>,
}

impl Iteration {
    pub(crate) fn new(vu: u64, metrics: Arc<MetricsAggregator>) -> Self {
        Self { vu, metrics }
    }

    /// Identity of the VU running this iteration.
    pub fn vu(&self) -> u64 {
        self.vu
    }

    /// Record a named assertion. Returns `passed` so it can be used inline.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.metrics.record_check(self.vu, name, passed);
        passed
    }
}

/// Per-iteration limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TypedBuilder)]
pub struct IterationSettings {
    /// Upper bound on one callback invocation
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
    /// Time the VU stays busy after the callback returns
    #[builder(default = Duration::ZERO)]
    pub pacing: Duration,
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What happened during one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub started: u64,
    pub dropped: u64,
}

/// Pure function computing how many iterations are due over `[from, to]`.
///
/// Returns `(starts, next_fractional)`.
pub fn calc_starts(schedule: &RateSchedule, from: Duration, to: Duration, fractional: f64) -> (u64, f64) {
    let due = schedule.starts_between(from, to) + fractional;
    let whole = (due + EPSILON).floor().max(0.0);
    let fractional = (due - whole).max(0.0);
    // saturate instead of wrapping on absurd rates
    let starts = if whole >= u64::MAX as f64 { u64::MAX } else { whole as u64 };
    (starts, fractional)
}

/// The tick loop. Built with [`Dispatcher::builder`]; `schedule`, `pool`,
/// `metrics` and `action` are required.
#[derive(TypedBuilder)]
pub struct Dispatcher<F, Fut> {
    schedule: Arc<RateSchedule>,
    pool: WorkerPool,
    metrics: Arc<MetricsAggregator>,
    action: F,
    #[builder(default)]
    settings: IterationSettings,
    #[builder(default = Duration::from_millis(20))]
    tick: Duration,
    /// Every spawned iteration is tracked here, so the caller can drain them
    #[builder(default)]
    tracker: TaskTracker,
    /// Cancelling this abandons every running iteration
    #[builder(default)]
    interrupt: CancellationToken,
    #[builder(default, setter(skip))]
    fractional: f64,
    #[builder(default, setter(skip))]
    last: Duration,
    #[builder(default, setter(skip))]
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Dispatcher<F, Fut>
where
    F: Fn(Iteration) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    /// Iterations due since the previous call. Advances the internal cursor.
    pub fn due(&mut self, elapsed: Duration) -> u64 {
        if elapsed <= self.last {
            return 0;
        }
        let (starts, fractional) = calc_starts(&self.schedule, self.last, elapsed, self.fractional);
        self.fractional = fractional;
        self.last = elapsed;
        starts
    }

    /// Start every iteration due at `elapsed`, then reap VUs idle as of
    /// `clock.now()`.
    pub fn tick<C: Clock>(&mut self, clock: &C, elapsed: Duration) -> TickOutcome {
        let due = self.due(elapsed);
        let mut outcome = TickOutcome::default();
        if due > 0 {
            self.metrics.record_started(due);
        }

        for _ in 0..due {
            match self.pool.try_acquire() {
                Some(slot) => {
                    self.spawn_iteration(clock, slot);
                    outcome.started += 1;
                }
                None => outcome.dropped += 1,
            }
        }

        if outcome.dropped > 0 {
            self.metrics.record_dropped(outcome.dropped);
            tracing::warn!(
                "Pool saturated at {} VUs: dropped {} iterations at {:?}",
                self.pool.settings().max,
                outcome.dropped,
                elapsed
            );
        }

        self.pool.reap_idle(clock.now());
        outcome
    }

    fn spawn_iteration<C: Clock>(&self, clock: &C, slot: VuSlot) {
        self.tracker.spawn(run_iteration(
            self.action.clone(),
            slot,
            Arc::clone(&self.metrics),
            self.settings,
            self.interrupt.clone(),
            clock.clone(),
        ));
    }

    /// Drive the schedule to exhaustion, ticking every `tick` on `clock`.
    ///
    /// Dropping the returned future stops dispatch after the last completed tick.
    pub async fn run<C: Clock>(&mut self, clock: &C) {
        let origin = clock.now();
        let total = self.schedule.total_duration();
        let stages = self.schedule.stage_count();
        let mut stage = None;
        let mut next_tick = origin;

        tracing::info!(
            "Dispatching for {:?} over {} stage(s), tick {:?}",
            total,
            stages,
            self.tick
        );

        loop {
            let elapsed = clock.now().saturating_duration_since(origin);
            if elapsed >= total {
                self.tick(clock, total);
                break;
            }

            let current = self.schedule.stage_at(elapsed);
            if current != stage {
                if let Some(i) = current {
                    tracing::info!(
                        "Starting stage: {}/{} (target {:.1}/s)",
                        i + 1,
                        stages,
                        self.schedule.target_rate(elapsed)
                    );
                }
                stage = current;
            }

            let outcome = self.tick(clock, elapsed);
            tracing::trace!(
                "tick at {:?}: started {}, dropped {}, active {}",
                elapsed,
                outcome.started,
                outcome.dropped,
                self.pool.active_count()
            );

            next_tick += self.tick;
            clock.sleep_until(next_tick).await;
        }

        tracing::info!("Schedule exhausted after {:?}", total);
    }
}

async fn run_iteration<F, Fut, C>(
    action: F,
    slot: VuSlot,
    metrics: Arc<MetricsAggregator>,
    settings: IterationSettings,
    interrupt: CancellationToken,
    clock: C,
) where
    F: Fn(Iteration) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    C: Clock,
{
    let vu = slot.id();
    let iteration = Iteration::new(vu, Arc::clone(&metrics));
    let started_at = clock.now();
    // calling the action inside the future keeps a panic in its synchronous part catchable
    let call = AssertUnwindSafe(async move { action(iteration).await }).catch_unwind();

    let status = tokio::select! {
        biased;
        _ = interrupt.cancelled() => StatusCategory::Interrupted,
        res = call => match res {
            Err(_) => {
                tracing::error!("VU {vu} iteration panicked");
                StatusCategory::Failure
            }
            Ok(Err(e)) => {
                tracing::debug!("VU {vu} iteration failed: {e}");
                StatusCategory::Failure
            }
            Ok(Ok(())) => StatusCategory::Success,
        },
        _ = clock.sleep(settings.timeout) => StatusCategory::Timeout,
    };

    metrics.ingest(IterationOutcome {
        vu,
        started_at,
        duration: clock.now().saturating_duration_since(started_at),
        status,
    });

    if !settings.pacing.is_zero() && status != StatusCategory::Interrupted {
        tokio::select! {
            _ = interrupt.cancelled() => {}
            _ = clock.sleep(settings.pacing) => {}
        }
    }
    drop(slot);
}
