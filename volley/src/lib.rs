//! Volley is an open-model, arrival-rate load generation engine.
//!
//! You describe *how many iterations should start per unit of time*, either at a
//! constant rate or as a series of linear ramps, and a callback describing one
//! iteration. Volley starts iterations on that curve no matter how long each
//! one takes: slow responses grow the pool of virtual users (VUs) instead of
//! slowing the arrival rate. When the pool is exhausted, starts are counted as
//! dropped rather than queued.
//!
//! # Architecture
//!
//! - [`RateSchedule`]: the target rate as a function of elapsed time.
//! - [`Dispatcher`]: the tick loop. Each tick it integrates the schedule,
//!   carries the fractional remainder, and starts that many iterations.
//! - [`WorkerPool`]: bounded, elastic set of VUs. Grows on demand up to `maxVUs`
//!   and reaps VUs that idled past their timeout.
//! - [`MetricsAggregator`]: sharded counters plus an HDR histogram of durations.
//! - [`ThresholdEvaluator`]: k6-style pass/fail conditions evaluated on a fixed
//!   period, optionally aborting the run.
//! - [`RunController`]: the lifecycle
//!   `Pending -> Ramping -> Draining -> {Completed, Aborted}` and the final
//!   summary handoff to a [`Reporter`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use volley::{
//!     Iteration, RunConfig, RunController, ScenarioConfig, StdoutReporter,
//!     config::ThresholdEntry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), volley::Error> {
//!     let config = RunConfig::builder()
//!         .name("health_check")
//!         .scenario(ScenarioConfig::constant(100, Duration::from_secs(30), 50, 200))
//!         .thresholds(
//!             [(
//!                 "iteration_failed".to_string(),
//!                 vec![ThresholdEntry::abort_on_fail("rate<0.01")],
//!             )]
//!             .into(),
//!         )
//!         .build();
//!
//!     let controller = RunController::new(&config, |it: Iteration| async move {
//!         // talk to the system under test here
//!         it.check("status was 200", true);
//!         Ok(())
//!     })?;
//!
//!     let summary = controller.run_and_report(&StdoutReporter).await?;
//!     println!("run {} finished: {}", summary.report_key(), summary.state);
//!     Ok(())
//! }
//! ```
//!
//! Build heavy objects such as HTTP clients once, outside the callback, and
//! clone them in.
//!
//! # Logging
//!
//! Volley emits [`tracing`] events and never installs a subscriber. State
//! transitions, stage changes and aborts are logged at `info`, dropped
//! iterations and failed thresholds at `warn`, callback panics at `error`.
//!
//! # Feature flags
//!
//! - `builtins`: the serializable [`Summary`](report::Summary) plus
//!   `StdoutReporter` and `JsonFileReporter`. (Enabled by default)
//!
//! See `examples/http.rs` for a runnable scenario against an HTTP service.

/// Time sources
pub mod clock;
/// Run configuration and validation
pub mod config;
/// Run lifecycle
pub mod controller;
/// The arrival-rate tick loop
pub mod dispatcher;
pub mod error;
/// Outcome aggregation
pub mod metrics;
/// Virtual user pool
pub mod pool;
/// Final summaries and reporters
pub mod report;
/// Rate curves
pub mod schedule;
/// Pass/fail thresholds
pub mod threshold;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{RunConfig, RunPlan, ScenarioConfig};
pub use controller::{RunController, RunHandle, RunState};
pub use dispatcher::{Dispatcher, Iteration, IterationSettings};
pub use error::{BoxError, ConfigError, Error};
pub use metrics::{MetricsAggregator, MetricsSnapshot, StatusCategory};
pub use pool::{PoolSettings, WorkerPool};
pub use report::{Reporter, RunSummary};
pub use schedule::{RateSchedule, Stage};
pub use threshold::{MetricSelector, Threshold, ThresholdEvaluator};

#[cfg(feature = "builtins")]
pub use report::{JsonFileReporter, StdoutReporter};
