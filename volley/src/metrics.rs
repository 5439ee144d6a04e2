//! Streaming collection of iteration outcomes.
//!
//! Every completing iteration ingests into one of several shards, chosen by VU
//! id, so concurrent producers rarely contend on the same lock. A shard is a
//! [`MetricsSnapshot`] behind a mutex; taking a snapshot merges all shards into
//! a fresh value. Merging is associative and commutative, so the result does not
//! depend on the order outcomes arrived in.
//!
//! Durations go into an HDR histogram (1µs to 1h, 3 significant figures), which
//! keeps memory constant no matter how long or how fast the run is.
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::time::Instant;

/// Highest trackable iteration duration, in microseconds.
const HISTOGRAM_MAX_MICROS: u64 = 60 * 60 * 1_000_000;
const HISTOGRAM_SIGFIG: u8 = 3;

fn duration_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, HISTOGRAM_MAX_MICROS, HISTOGRAM_SIGFIG)
        .expect("histogram bounds are statically valid")
}

/// How an iteration ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    /// The callback returned `Ok`
    Success,
    /// The callback returned an error or panicked
    Failure,
    /// The callback exceeded the per-iteration timeout
    Timeout,
    /// Still running when the graceful-stop deadline passed
    Interrupted,
}

/// The result of one completed iteration. Consumed exactly once by
/// [`MetricsAggregator::ingest`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationOutcome {
    pub vu: u64,
    pub started_at: Instant,
    pub duration: Duration,
    pub status: StatusCategory,
}

impl IterationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StatusCategory::Success
    }
}

/// Pass/total counts for one named check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounts {
    pub passed: u64,
    pub total: u64,
}

/// Point-in-time copy of everything the aggregator knows.
#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    /// Intended starts, dispatched or dropped
    pub total_started: u64,
    pub total_completed: u64,
    /// Completed iterations that did not succeed, timeouts and interruptions included
    pub fail_count: u64,
    pub timeout_count: u64,
    pub interrupted_count: u64,
    /// Intended starts that found the pool saturated
    pub dropped_count: u64,
    pub checks_passed: u64,
    pub checks_total: u64,
    pub checks: BTreeMap<String, CheckCounts>,
    /// Iteration durations in microseconds
    pub durations: Histogram<u64>,
    /// Time since the run started, or since the aggregator was created
    /// when used on its own
    pub elapsed: Duration,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            total_started: 0,
            total_completed: 0,
            fail_count: 0,
            timeout_count: 0,
            interrupted_count: 0,
            dropped_count: 0,
            checks_passed: 0,
            checks_total: 0,
            checks: BTreeMap::new(),
            durations: duration_histogram(),
            elapsed: Duration::ZERO,
        }
    }
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one completed iteration into the counters.
    pub fn consume(&mut self, outcome: &IterationOutcome) {
        self.total_completed += 1;
        match outcome.status {
            StatusCategory::Success => {}
            StatusCategory::Failure => self.fail_count += 1,
            StatusCategory::Timeout => {
                self.fail_count += 1;
                self.timeout_count += 1;
            }
            StatusCategory::Interrupted => {
                self.fail_count += 1;
                self.interrupted_count += 1;
            }
        }
        let micros = u64::try_from(outcome.duration.as_micros()).unwrap_or(u64::MAX);
        self.durations.saturating_record(micros.max(1));
    }

    pub fn consume_check(&mut self, name: &str, passed: bool) {
        self.checks_total += 1;
        self.checks_passed += u64::from(passed);
        if !self.checks.contains_key(name) {
            self.checks.insert(name.to_owned(), CheckCounts::default());
        }
        if let Some(entry) = self.checks.get_mut(name) {
            entry.total += 1;
            entry.passed += u64::from(passed);
        }
    }

    /// Combine another snapshot into this one. `elapsed` keeps the larger value.
    pub fn merge(&mut self, other: &Self) {
        self.total_started += other.total_started;
        self.total_completed += other.total_completed;
        self.fail_count += other.fail_count;
        self.timeout_count += other.timeout_count;
        self.interrupted_count += other.interrupted_count;
        self.dropped_count += other.dropped_count;
        self.checks_passed += other.checks_passed;
        self.checks_total += other.checks_total;
        for (name, counts) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_default();
            entry.passed += counts.passed;
            entry.total += counts.total;
        }
        if let Err(e) = self.durations.add(&other.durations) {
            tracing::warn!("Failed to merge duration histograms: {e}");
        }
        self.elapsed = self.elapsed.max(other.elapsed);
    }

    /// Starts that actually reached a VU.
    pub fn dispatched(&self) -> u64 {
        self.total_started.saturating_sub(self.dropped_count)
    }

    /// Dispatched iterations that have not reported an outcome yet.
    pub fn in_flight(&self) -> u64 {
        self.dispatched().saturating_sub(self.total_completed)
    }

    /// Failed share of completed iterations, `None` before the first completion.
    pub fn failure_rate(&self) -> Option<f64> {
        (self.total_completed > 0).then(|| self.fail_count as f64 / self.total_completed as f64)
    }

    /// Passed share of all checks, `None` before the first check.
    pub fn check_rate(&self) -> Option<f64> {
        (self.checks_total > 0).then(|| self.checks_passed as f64 / self.checks_total as f64)
    }

    fn has_durations(&self) -> bool {
        self.durations.len() > 0
    }

    /// Duration at quantile `q` (0.0..=1.0), in milliseconds.
    pub fn duration_quantile_ms(&self, q: f64) -> Option<f64> {
        self.has_durations()
            .then(|| self.durations.value_at_quantile(q) as f64 / 1000.0)
    }

    pub fn duration_mean_ms(&self) -> Option<f64> {
        self.has_durations().then(|| self.durations.mean() / 1000.0)
    }

    pub fn duration_min_ms(&self) -> Option<f64> {
        self.has_durations().then(|| self.durations.min() as f64 / 1000.0)
    }

    pub fn duration_max_ms(&self) -> Option<f64> {
        self.has_durations().then(|| self.durations.max() as f64 / 1000.0)
    }
}

/// Thread-safe, append-only sink for every outcome of a run.
pub struct MetricsAggregator {
    shards: Vec<Mutex<MetricsSnapshot>>,
    started: AtomicU64,
    dropped: AtomicU64,
    origin: Mutex<Instant>,
}

impl MetricsAggregator {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        Self {
            shards: (0..num_shards).map(|_| Mutex::new(MetricsSnapshot::new())).collect(),
            started: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            origin: Mutex::new(Instant::now()),
        }
    }

    /// Shard count scaled to the machine, as used when none is configured.
    pub fn default_shards() -> usize {
        (num_cpus::get() * 4).clamp(4, 256)
    }

    fn shard(&self, vu: u64) -> &Mutex<MetricsSnapshot> {
        &self.shards[(vu % self.shards.len() as u64) as usize]
    }

    pub fn record_started(&self, n: u64) {
        self.started.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn ingest(&self, outcome: IterationOutcome) {
        self.shard(outcome.vu).lock().consume(&outcome);
    }

    pub fn record_check(&self, vu: u64, name: &str, passed: bool) {
        self.shard(vu).lock().consume_check(name, passed);
    }

    /// Measure `elapsed` from `origin` from now on. The run calls this when
    /// dispatch begins, so time spent between construction and the run does
    /// not dilute per-second rates.
    pub fn start_at(&self, origin: Instant) {
        *self.origin.lock() = origin;
    }

    /// [`snapshot_at`](Self::snapshot_at) the Tokio clock's current instant.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Merge every shard, with `elapsed` measured up to `now`.
    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let mut merged = MetricsSnapshot::new();
        for shard in &self.shards {
            merged.merge(&shard.lock());
        }
        merged.total_started = self.started.load(Ordering::Relaxed);
        merged.dropped_count = self.dropped.load(Ordering::Relaxed);
        merged.elapsed = now.saturating_duration_since(*self.origin.lock());
        merged
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(Self::default_shards())
    }
}
