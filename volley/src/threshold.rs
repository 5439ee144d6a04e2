//! Pass/fail conditions over aggregated metrics.
//!
//! Thresholds use the familiar `aggregation operator bound` form, e.g.
//! `p(95)<500`, `rate<0.01` or `count >= 100`, attached to a metric name. They
//! are parsed once while the configuration is validated and never change.
//!
//! The [`ThresholdEvaluator`] checks every threshold against a snapshot on a
//! fixed period. A failing threshold is remembered for the final report; one
//! marked `abort_on_fail` also asks the run to abort. Only the first cycle with
//! abort-worthy failures produces an abort, and every threshold that failed in
//! that cycle is recorded as a cause.
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    metrics::{MetricsAggregator, MetricsSnapshot},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdParseError {
    #[error("empty threshold expression")]
    Empty,
    #[error("missing comparison operator in `{0}`")]
    MissingOperator(String),
    #[error("unknown aggregation `{0}`")]
    UnknownAggregation(String),
    #[error("percentile must be in (0, 100], got `{0}`")]
    InvalidPercentile(String),
    #[error("bound `{0}` is not a number")]
    InvalidBound(String),
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("`{aggregation}` is not supported on `{metric}`")]
    Unsupported {
        metric: MetricSelector,
        aggregation: Aggregation,
    },
}

/// The metrics a threshold can select.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSelector {
    /// Share of completed iterations that failed
    IterationFailed,
    /// Iteration durations in milliseconds
    IterationDuration,
    /// Share of checks that passed
    Checks,
    /// Completed iterations
    Iterations,
    /// Starts dropped on a saturated pool
    DroppedIterations,
}

impl MetricSelector {
    pub fn name(self) -> &'static str {
        match self {
            Self::IterationFailed => "iteration_failed",
            Self::IterationDuration => "iteration_duration",
            Self::Checks => "checks",
            Self::Iterations => "iterations",
            Self::DroppedIterations => "dropped_iterations",
        }
    }

    fn supports(self, aggregation: Aggregation) -> bool {
        use Aggregation::*;
        match self {
            Self::IterationFailed | Self::Checks => matches!(aggregation, Rate),
            Self::IterationDuration => {
                matches!(aggregation, Avg | Min | Max | Med | Percentile(_))
            }
            Self::Iterations | Self::DroppedIterations => matches!(aggregation, Count | Rate),
        }
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricSelector {
    type Err = ThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "iteration_failed" | "http_req_failed" => Ok(Self::IterationFailed),
            "iteration_duration" | "http_req_duration" => Ok(Self::IterationDuration),
            "checks" => Ok(Self::Checks),
            "iterations" => Ok(Self::Iterations),
            "dropped_iterations" => Ok(Self::DroppedIterations),
            other => Err(ThresholdParseError::UnknownMetric(other.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    /// Ratio for rate metrics, per-second throughput for counters
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in (0, 100]
    Percentile(f64),
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rate => f.write_str("rate"),
            Self::Count => f.write_str("count"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = ThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "rate" => return Ok(Self::Rate),
            "count" => return Ok(Self::Count),
            "avg" => return Ok(Self::Avg),
            "min" => return Ok(Self::Min),
            "max" => return Ok(Self::Max),
            "med" => return Ok(Self::Med),
            _ => {}
        }

        let inner = s
            .strip_prefix("p(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ThresholdParseError::UnknownAggregation(s.to_owned()))?;
        match inner.trim().parse::<f64>() {
            Ok(p) if p > 0.0 && p <= 100.0 => Ok(Self::Percentile(p)),
            _ => Err(ThresholdParseError::InvalidPercentile(inner.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => (observed - bound).abs() < f64::EPSILON,
            Self::Ne => (observed - bound).abs() >= f64::EPSILON,
        }
    }
}

/// `aggregation operator bound`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Condition {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl Condition {
    pub fn holds(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.bound)
    }
}

impl FromStr for Condition {
    type Err = ThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ThresholdParseError::Empty);
        }

        let (at, token, comparison) = Comparison::TOKENS
            .iter()
            .filter_map(|(token, cmp)| s.find(token).map(|at| (at, *token, *cmp)))
            // leftmost operator, longest token on a tie so `<=` is not read as `<`
            .min_by_key(|(at, token, _)| (*at, std::cmp::Reverse(token.len())))
            .ok_or_else(|| ThresholdParseError::MissingOperator(s.to_owned()))?;

        let aggregation = s[..at].parse()?;
        let bound_str = s[at + token.len()..].trim();
        let bound = bound_str
            .parse::<f64>()
            .map_err(|_| ThresholdParseError::InvalidBound(bound_str.to_owned()))?;

        Ok(Self {
            aggregation,
            comparison,
            bound,
        })
    }
}

/// A parsed, immutable pass/fail condition on one metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    pub metric: MetricSelector,
    pub condition: Condition,
    pub abort_on_fail: bool,
    /// The expression as written
    pub expression: String,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str, abort_on_fail: bool) -> Result<Self, ThresholdParseError> {
        let metric: MetricSelector = metric.parse()?;
        let condition: Condition = expression.parse()?;
        if !metric.supports(condition.aggregation) {
            return Err(ThresholdParseError::Unsupported {
                metric,
                aggregation: condition.aggregation,
            });
        }
        Ok(Self {
            metric,
            condition,
            abort_on_fail,
            expression: expression.trim().to_owned(),
        })
    }

    /// The value this threshold looks at, or `None` while there is no data.
    pub fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        use Aggregation::*;
        let per_second = |n: u64| {
            let secs = snapshot.elapsed.as_secs_f64();
            (secs > 0.0).then(|| n as f64 / secs)
        };

        match (self.metric, self.condition.aggregation) {
            (MetricSelector::IterationFailed, _) => snapshot.failure_rate(),
            (MetricSelector::Checks, _) => snapshot.check_rate(),
            (MetricSelector::IterationDuration, Avg) => snapshot.duration_mean_ms(),
            (MetricSelector::IterationDuration, Min) => snapshot.duration_min_ms(),
            (MetricSelector::IterationDuration, Max) => snapshot.duration_max_ms(),
            (MetricSelector::IterationDuration, Med) => snapshot.duration_quantile_ms(0.5),
            (MetricSelector::IterationDuration, Percentile(p)) => {
                snapshot.duration_quantile_ms(p / 100.0)
            }
            (MetricSelector::IterationDuration, _) => None,
            (MetricSelector::Iterations, Rate) => per_second(snapshot.total_completed),
            (MetricSelector::Iterations, _) => Some(snapshot.total_completed as f64),
            (MetricSelector::DroppedIterations, Rate) => per_second(snapshot.dropped_count),
            (MetricSelector::DroppedIterations, _) => Some(snapshot.dropped_count as f64),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression)
    }
}

/// An abort-on-fail threshold that tripped, with the value that tripped it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbortCause {
    pub metric: MetricSelector,
    pub expression: String,
    pub observed: f64,
}

/// Final standing of one threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: MetricSelector,
    pub expression: String,
    pub abort_on_fail: bool,
    /// Outcome against the final snapshot
    pub passed: bool,
    /// Failed at least one periodic evaluation
    pub breached_during_run: bool,
    pub observed: Option<f64>,
}

struct ThresholdState {
    threshold: Threshold,
    observed: Option<f64>,
    breached: bool,
}

/// What the run should do after an evaluation cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Continue,
    Abort(Vec<AbortCause>),
}

pub struct ThresholdEvaluator {
    states: Vec<ThresholdState>,
    abort_causes: Vec<AbortCause>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self {
            states: thresholds
                .into_iter()
                .map(|threshold| ThresholdState {
                    threshold,
                    observed: None,
                    breached: false,
                })
                .collect(),
            abort_causes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Check every threshold against `snapshot`.
    ///
    /// Thresholds whose metric has no data yet are skipped.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot) -> Verdict {
        let already_aborted = !self.abort_causes.is_empty();
        let mut causes = Vec::new();

        for state in &mut self.states {
            let Some(observed) = state.threshold.observe(snapshot) else {
                continue;
            };
            state.observed = Some(observed);
            if state.threshold.condition.holds(observed) {
                continue;
            }

            if !state.breached {
                tracing::warn!("Threshold failed: {} (observed {observed:.4})", state.threshold);
            }
            state.breached = true;
            if state.threshold.abort_on_fail && !already_aborted {
                causes.push(AbortCause {
                    metric: state.threshold.metric,
                    expression: state.threshold.expression.clone(),
                    observed,
                });
            }
        }

        if causes.is_empty() {
            Verdict::Continue
        } else {
            self.abort_causes.clone_from(&causes);
            Verdict::Abort(causes)
        }
    }

    /// Abort causes recorded so far; empty unless an abort was signalled.
    pub fn abort_causes(&self) -> &[AbortCause] {
        &self.abort_causes
    }

    /// Evaluate once more against the final snapshot and report every threshold.
    /// A metric that never produced data passes.
    pub fn finalize(&mut self, snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
        self.states
            .iter_mut()
            .map(|state| {
                let observed = state.threshold.observe(snapshot).or(state.observed);
                let passed = observed.map_or(true, |v| state.threshold.condition.holds(v));
                state.observed = observed;
                ThresholdResult {
                    metric: state.threshold.metric,
                    expression: state.threshold.expression.clone(),
                    abort_on_fail: state.threshold.abort_on_fail,
                    passed,
                    breached_during_run: state.breached,
                    observed,
                }
            })
            .collect()
    }
}

/// Evaluation loop: every `period`, evaluate the latest snapshot and cancel
/// `abort` the first time an abort-on-fail threshold fails.
///
/// Runs until `done` is cancelled and hands the evaluator back for finalizing.
pub async fn run_evaluator<C: Clock>(
    mut evaluator: ThresholdEvaluator,
    metrics: Arc<MetricsAggregator>,
    clock: C,
    period: Duration,
    abort: CancellationToken,
    done: CancellationToken,
) -> ThresholdEvaluator {
    if evaluator.is_empty() {
        done.cancelled().await;
        return evaluator;
    }

    let mut next = clock.now();
    loop {
        next += period;
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = clock.sleep_until(next) => {}
        }

        let snapshot = metrics.snapshot_at(clock.now());
        if let Verdict::Abort(causes) = evaluator.evaluate(&snapshot) {
            for cause in &causes {
                tracing::error!(
                    "Aborting: threshold {}: {} failed (observed {:.4})",
                    cause.metric,
                    cause.expression,
                    cause.observed
                );
            }
            abort.cancel();
        }
    }
    tracing::debug!("Threshold evaluator stopped.");
    evaluator
}
