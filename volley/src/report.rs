use chrono::{DateTime, Utc};
use std::{future::Future, time::Duration};

use crate::{
    controller::RunState,
    error::BoxError,
    metrics::MetricsSnapshot,
    threshold::{AbortCause, ThresholdResult},
};

/// Everything a run produced, handed to a [`Reporter`] exactly once.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// `Completed` or `Aborted`
    pub state: RunState,
    /// Empty unless the run was aborted
    pub abort_causes: Vec<AbortCause>,
    pub thresholds: Vec<ThresholdResult>,
    pub snapshot: MetricsSnapshot,
    /// Most VUs active at the same time
    pub peak_vus: u64,
    /// VUs in existence when the run ended
    pub allocated_vus: u64,
}

impl RunSummary {
    /// Identifies the run in report storage: `{name}_{YYYYMMDD}_{HHMMSS}`.
    pub fn report_key(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{name}_{}", self.started_at.format("%Y%m%d_%H%M%S"))
    }

    /// Wall-clock length of the run.
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }

    /// Completed with every threshold passing.
    pub fn passed(&self) -> bool {
        self.state == RunState::Completed && self.thresholds.iter().all(|t| t.passed)
    }
}

/// Consumes the final summary and sends it somewhere (stdout, file, database).
pub trait Reporter {
    fn report(&self, summary: &RunSummary) -> impl Future<Output = Result<(), BoxError>> + Send;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, path::PathBuf};

    use super::*;
    use crate::metrics::CheckCounts;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct IterationStats {
        pub started: u64,
        pub completed: u64,
        pub dropped: u64,
        pub failed: u64,
        pub timed_out: u64,
        pub interrupted: u64,
        /// Completed per second of run time
        pub rate: f64,
        pub failure_rate: Option<f64>,
    }

    /// Iteration durations in milliseconds.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct DurationStats {
        pub avg: Option<f64>,
        pub min: Option<f64>,
        pub med: Option<f64>,
        pub max: Option<f64>,
        pub p90: Option<f64>,
        pub p95: Option<f64>,
        pub p99: Option<f64>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct CheckStats {
        pub passed: u64,
        pub total: u64,
        pub rate: Option<f64>,
        pub by_name: BTreeMap<String, CheckCounts>,
    }

    /// Serializable rendition of a [`RunSummary`].
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Summary {
        pub key: String,
        pub name: String,
        pub state: RunState,
        pub started_at: DateTime<Utc>,
        pub ended_at: DateTime<Utc>,
        pub iterations: IterationStats,
        pub iteration_duration: DurationStats,
        pub checks: CheckStats,
        pub thresholds: Vec<ThresholdResult>,
        pub abort_causes: Vec<AbortCause>,
        pub peak_vus: u64,
        pub allocated_vus: u64,
    }

    impl From<&RunSummary> for Summary {
        fn from(value: &RunSummary) -> Self {
            let snap = &value.snapshot;
            let secs = snap.elapsed.as_secs_f64();
            Self {
                key: value.report_key(),
                name: value.name.clone(),
                state: value.state,
                started_at: value.started_at,
                ended_at: value.ended_at,
                iterations: IterationStats {
                    started: snap.total_started,
                    completed: snap.total_completed,
                    dropped: snap.dropped_count,
                    failed: snap.fail_count,
                    timed_out: snap.timeout_count,
                    interrupted: snap.interrupted_count,
                    rate: if secs > 0.0 { snap.total_completed as f64 / secs } else { 0.0 },
                    failure_rate: snap.failure_rate(),
                },
                iteration_duration: DurationStats {
                    avg: snap.duration_mean_ms(),
                    min: snap.duration_min_ms(),
                    med: snap.duration_quantile_ms(0.5),
                    max: snap.duration_max_ms(),
                    p90: snap.duration_quantile_ms(0.90),
                    p95: snap.duration_quantile_ms(0.95),
                    p99: snap.duration_quantile_ms(0.99),
                },
                checks: CheckStats {
                    passed: snap.checks_passed,
                    total: snap.checks_total,
                    rate: snap.check_rate(),
                    by_name: snap.checks.clone(),
                },
                thresholds: value.thresholds.clone(),
                abort_causes: value.abort_causes.clone(),
                peak_vus: value.peak_vus,
                allocated_vus: value.allocated_vus,
            }
        }
    }

    /// Prints the [`Summary`] as pretty JSON.
    pub struct StdoutReporter;

    impl Reporter for StdoutReporter {
        async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
            let rendered = serde_json::to_string_pretty(&Summary::from(summary))?;
            println!("{rendered}");
            Ok(())
        }
    }

    /// Writes the [`Summary`] to `{dir}/{report_key}.json`.
    pub struct JsonFileReporter {
        pub dir: PathBuf,
    }

    impl JsonFileReporter {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
            self.dir.join(format!("{}.json", summary.report_key()))
        }
    }

    impl Reporter for JsonFileReporter {
        async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
            let rendered = serde_json::to_vec_pretty(&Summary::from(summary))?;
            let path = self.path_for(summary);
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, rendered).await?;
            tracing::info!("Summary written to {}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(name: &str) -> RunSummary {
        RunSummary {
            name: name.into(),
            started_at: Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2024, 3, 9, 7, 6, 1).unwrap(),
            state: RunState::Completed,
            abort_causes: vec![],
            thresholds: vec![],
            snapshot: MetricsSnapshot::new(),
            peak_vus: 0,
            allocated_vus: 0,
        }
    }

    #[test]
    fn report_key_is_name_and_start_time() {
        assert_eq!(summary("ramping").report_key(), "ramping_20240309_070501");
        assert_eq!(
            summary("create user/api").report_key(),
            "create_user_api_20240309_070501"
        );
    }

    #[test]
    fn duration_and_verdict() {
        let mut s = summary("x");
        assert_eq!(s.duration(), Duration::from_secs(60));
        assert!(s.passed());
        s.state = RunState::Aborted;
        assert!(!s.passed());
    }

    #[cfg(feature = "builtins")]
    #[test]
    fn summary_serializes_empty_run() {
        let json = serde_json::to_value(Summary::from(&summary("empty"))).unwrap();
        assert_eq!(json["state"], "completed");
        assert_eq!(json["iterations"]["started"], 0);
        assert!(json["iteration_duration"]["p95"].is_null());
        assert_eq!(json["key"], "empty_20240309_070501");
    }
}
