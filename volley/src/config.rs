//! Run configuration.
//!
//! A [`RunConfig`] can be built in code through its builder or deserialized
//! from a k6-style JSON document:
//!
//! ```json
//! {
//!   "name": "checkout",
//!   "scenario": {
//!     "executor": "ramping-arrival-rate",
//!     "startRate": 10,
//!     "timeUnit": "1s",
//!     "preAllocatedVUs": 50,
//!     "maxVUs": 200,
//!     "stages": [
//!       { "duration": "30s", "target": 100 },
//!       { "duration": "1m", "target": 100 }
//!     ]
//!   },
//!   "thresholds": {
//!     "iteration_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }],
//!     "iteration_duration": ["p(95)<500"]
//!   }
//! }
//! ```
//!
//! Durations accept humantime strings (`"500ms"`, `"1m30s"`) or whole seconds.
//! [`RunConfig::validate`] turns the document into a [`RunPlan`]; every
//! configuration error surfaces there, before any traffic is generated.
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use typed_builder::TypedBuilder;

use crate::{
    dispatcher::IterationSettings,
    error::ConfigError,
    metrics::MetricsAggregator,
    pool::{PoolSettings, MAX_VUS},
    schedule::{RateSchedule, Stage},
    threshold::Threshold,
};

pub(crate) mod human_duration {
    use serde::{de, Deserializer, Serializer};
    use std::{fmt, time::Duration};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration such as \"1m30s\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                humantime::parse_duration(v.trim()).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
                Duration::try_from_secs_f64(v).map_err(E::custom)
            }
        }

        d.deserialize_any(Visitor)
    }
}

fn one_second() -> Duration {
    Duration::from_secs(1)
}

fn thirty_seconds() -> Duration {
    Duration::from_secs(30)
}

fn sixty_seconds() -> Duration {
    Duration::from_secs(60)
}

fn default_tick() -> Duration {
    Duration::from_millis(20)
}

/// Arrival-rate executor of the single scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ScenarioConfig {
    /// `rate` iterations per `time_unit` for `duration`.
    ConstantArrivalRate {
        rate: u64,
        #[serde(default = "one_second", with = "human_duration")]
        time_unit: Duration,
        #[serde(with = "human_duration")]
        duration: Duration,
        #[serde(rename = "preAllocatedVUs")]
        pre_allocated_vus: u64,
        #[serde(default, rename = "maxVUs")]
        max_vus: Option<u64>,
        #[serde(default = "thirty_seconds", with = "human_duration")]
        graceful_stop: Duration,
    },
    /// Linear ramps from `start_rate` through every stage target.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: u64,
        #[serde(default = "one_second", with = "human_duration")]
        time_unit: Duration,
        #[serde(rename = "preAllocatedVUs")]
        pre_allocated_vus: u64,
        #[serde(default, rename = "maxVUs")]
        max_vus: Option<u64>,
        stages: Vec<Stage>,
        #[serde(default = "thirty_seconds", with = "human_duration")]
        graceful_stop: Duration,
    },
}

impl ScenarioConfig {
    pub fn constant(rate: u64, duration: Duration, pre_allocated_vus: u64, max_vus: u64) -> Self {
        Self::ConstantArrivalRate {
            rate,
            time_unit: one_second(),
            duration,
            pre_allocated_vus,
            max_vus: Some(max_vus),
            graceful_stop: thirty_seconds(),
        }
    }

    pub fn ramping(start_rate: u64, stages: Vec<Stage>, pre_allocated_vus: u64, max_vus: u64) -> Self {
        Self::RampingArrivalRate {
            start_rate,
            time_unit: one_second(),
            pre_allocated_vus,
            max_vus: Some(max_vus),
            stages,
            graceful_stop: thirty_seconds(),
        }
    }

    /// Override the grace period given to in-flight iterations once
    /// dispatch ends.
    pub fn with_graceful_stop(mut self, stop: Duration) -> Self {
        match &mut self {
            Self::ConstantArrivalRate { graceful_stop, .. }
            | Self::RampingArrivalRate { graceful_stop, .. } => *graceful_stop = stop,
        }
        self
    }

    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        match &mut self {
            Self::ConstantArrivalRate { time_unit, .. } | Self::RampingArrivalRate { time_unit, .. } => {
                *time_unit = unit
            }
        }
        self
    }

    fn vus(&self) -> (u64, u64) {
        let (pre, max) = match self {
            Self::ConstantArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            }
            | Self::RampingArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            } => (*pre_allocated_vus, *max_vus),
        };
        (pre, max.unwrap_or(pre))
    }

    fn graceful_stop(&self) -> Duration {
        match self {
            Self::ConstantArrivalRate { graceful_stop, .. }
            | Self::RampingArrivalRate { graceful_stop, .. } => *graceful_stop,
        }
    }

    fn schedule(&self) -> Result<RateSchedule, ConfigError> {
        match self {
            Self::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                ..
            } => RateSchedule::constant(*rate, *time_unit, *duration),
            Self::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                ..
            } => RateSchedule::ramping(*start_rate, *time_unit, stages),
        }
    }
}

/// One threshold entry: a bare expression or an expression with options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default, rename = "abortOnFail")]
        abort_on_fail: bool,
    },
}

impl ThresholdEntry {
    pub fn abort_on_fail(expr: impl Into<String>) -> Self {
        Self::Detailed {
            threshold: expr.into(),
            abort_on_fail: true,
        }
    }

    fn parts(&self) -> (&str, bool) {
        match self {
            Self::Expr(e) => (e, false),
            Self::Detailed {
                threshold,
                abort_on_fail,
            } => (threshold, *abort_on_fail),
        }
    }
}

impl From<&str> for ThresholdEntry {
    fn from(value: &str) -> Self {
        Self::Expr(value.to_owned())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    /// Used in log lines and the report key
    #[builder(setter(into))]
    pub name: String,
    pub scenario: ScenarioConfig,
    /// Metric name to its thresholds
    #[serde(default)]
    #[builder(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdEntry>>,
    /// Hold each VU this long after its iteration returns
    #[serde(default, with = "human_duration")]
    #[builder(default)]
    pub pacing: Duration,
    #[serde(default = "sixty_seconds", with = "human_duration")]
    #[builder(default = sixty_seconds())]
    pub iteration_timeout: Duration,
    /// Dispatch resolution
    #[serde(default = "default_tick", with = "human_duration")]
    #[builder(default = default_tick())]
    pub tick: Duration,
    #[serde(default = "one_second", with = "human_duration")]
    #[builder(default = one_second())]
    pub evaluation_period: Duration,
    /// VUs above `preAllocatedVUs` idle this long are destroyed
    #[serde(default = "thirty_seconds", with = "human_duration")]
    #[builder(default = thirty_seconds())]
    pub vu_idle_timeout: Duration,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub metric_shards: Option<usize>,
}

impl RunConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check every constraint and resolve defaults.
    pub fn validate(&self) -> Result<RunPlan, ConfigError> {
        for (name, value) in [
            ("tick", self.tick),
            ("evaluationPeriod", self.evaluation_period),
            ("iterationTimeout", self.iteration_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.metric_shards == Some(0) {
            return Err(ConfigError::ZeroInterval("metricShards"));
        }

        let (pre_allocated, max) = self.scenario.vus();
        if max == 0 {
            return Err(ConfigError::NoVus);
        }
        if max > MAX_VUS {
            return Err(ConfigError::TooManyVus(max));
        }
        if pre_allocated > max {
            return Err(ConfigError::PreAllocatedExceedsMax { pre_allocated, max });
        }

        let schedule = self.scenario.schedule()?;

        let mut thresholds = Vec::new();
        for (metric, entries) in &self.thresholds {
            for entry in entries {
                let (expr, abort_on_fail) = entry.parts();
                let threshold =
                    Threshold::parse(metric, expr, abort_on_fail).map_err(|source| ConfigError::Threshold {
                        metric: metric.clone(),
                        source,
                    })?;
                thresholds.push(threshold);
            }
        }

        Ok(RunPlan {
            name: self.name.clone(),
            schedule: Arc::new(schedule),
            pool: PoolSettings::builder()
                .pre_allocated(pre_allocated)
                .max(max)
                .idle_timeout(self.vu_idle_timeout)
                .build(),
            thresholds,
            graceful_stop: self.scenario.graceful_stop(),
            iteration: IterationSettings::builder()
                .timeout(self.iteration_timeout)
                .pacing(self.pacing)
                .build(),
            tick: self.tick,
            evaluation_period: self.evaluation_period,
            metric_shards: self.metric_shards.unwrap_or_else(MetricsAggregator::default_shards),
        })
    }
}

/// A validated configuration, ready to run.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub name: String,
    pub schedule: Arc<RateSchedule>,
    pub pool: PoolSettings,
    pub thresholds: Vec<Threshold>,
    pub graceful_stop: Duration,
    pub iteration: IterationSettings,
    pub tick: Duration,
    pub evaluation_period: Duration,
    pub metric_shards: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{MetricSelector, ThresholdParseError};

    const RAMPING: &str = r#"{
        "name": "ramp",
        "scenario": {
            "executor": "ramping-arrival-rate",
            "startRate": 0,
            "timeUnit": "1s",
            "preAllocatedVUs": 10,
            "maxVUs": 50,
            "stages": [
                { "duration": "10s", "target": 100 },
                { "duration": 5, "target": 100 }
            ]
        },
        "thresholds": {
            "http_req_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }],
            "http_req_duration": ["p(95)<500", "avg<200"]
        },
        "pacing": "100ms"
    }"#;

    fn constant(pre: u64, max: u64) -> RunConfig {
        RunConfig::builder()
            .name("const")
            .scenario(ScenarioConfig::constant(100, Duration::from_secs(1), pre, max))
            .build()
    }

    #[test]
    fn parses_k6_style_document() {
        let config = RunConfig::from_json_str(RAMPING).unwrap();
        assert_eq!(config.pacing, Duration::from_millis(100));
        assert_eq!(config.tick, Duration::from_millis(20));
        assert_eq!(config.iteration_timeout, Duration::from_secs(60));

        let plan = config.validate().unwrap();
        assert_eq!(plan.schedule.total_duration(), Duration::from_secs(15));
        assert_eq!(plan.pool.pre_allocated, 10);
        assert_eq!(plan.pool.max, 50);
        assert_eq!(plan.graceful_stop, Duration::from_secs(30));
        assert_eq!(plan.iteration.pacing, Duration::from_millis(100));

        assert_eq!(plan.thresholds.len(), 3);
        let failed = plan
            .thresholds
            .iter()
            .find(|t| t.metric == MetricSelector::IterationFailed)
            .unwrap();
        assert!(failed.abort_on_fail);
        assert!(plan
            .thresholds
            .iter()
            .filter(|t| t.metric == MetricSelector::IterationDuration)
            .all(|t| !t.abort_on_fail));
    }

    #[test]
    fn constant_executor_defaults() {
        let config = RunConfig::from_json_str(
            r#"{
                "name": "c",
                "scenario": {
                    "executor": "constant-arrival-rate",
                    "rate": 120,
                    "timeUnit": "1m",
                    "duration": "2m",
                    "preAllocatedVUs": 4
                }
            }"#,
        )
        .unwrap();
        let plan = config.validate().unwrap();
        assert_eq!(plan.pool.max, 4);
        assert!((plan.schedule.target_rate(Duration::from_secs(1)) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_pre_allocated_above_max() {
        assert!(matches!(
            constant(10, 5).validate(),
            Err(ConfigError::PreAllocatedExceedsMax { pre_allocated: 10, max: 5 })
        ));
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(matches!(constant(0, 0).validate(), Err(ConfigError::NoVus)));
        assert!(matches!(
            constant(0, MAX_VUS + 1).validate(),
            Err(ConfigError::TooManyVus(_))
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut config = constant(1, 1);
        config.tick = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroInterval("tick"))));

        let mut config = constant(1, 1);
        config.evaluation_period = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("evaluationPeriod"))
        ));
    }

    #[test]
    fn rejects_bad_thresholds() {
        let mut config = constant(1, 1);
        config.thresholds.insert("latency".into(), vec!["p(95)<500".into()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Threshold {
                source: ThresholdParseError::UnknownMetric(_),
                ..
            })
        ));

        let mut config = constant(1, 1);
        config
            .thresholds
            .insert("iteration_failed".into(), vec!["rate<".into()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Threshold {
                source: ThresholdParseError::InvalidBound(_),
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_stages_and_unknown_executors() {
        let config = RunConfig::builder()
            .name("r")
            .scenario(ScenarioConfig::ramping(0, vec![], 1, 1))
            .build();
        assert!(matches!(config.validate(), Err(ConfigError::EmptySchedule)));

        let unknown = r#"{ "name": "x", "scenario": { "executor": "shared-iterations", "vus": 1 } }"#;
        assert!(matches!(
            RunConfig::from_json_str(unknown),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn durations_serialize_as_humantime() {
        let config = constant(1, 1);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tick"], "20ms");
        assert_eq!(json["scenario"]["duration"], "1s");
        assert_eq!(json["scenario"]["executor"], "constant-arrival-rate");
        assert_eq!(json["scenario"]["preAllocatedVUs"], 1);

        let back: RunConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
