use thiserror::Error;

use crate::threshold::ThresholdParseError;

/// Error type returned by iteration callbacks.
///
/// Anything the callback reports through it is recorded as a failed iteration;
/// it never reaches the scheduling loop.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid run configuration. Raised before any traffic is generated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("schedule has no stages")]
    EmptySchedule,
    #[error("schedule has zero total duration")]
    ZeroDuration,
    #[error("timeUnit must be greater than zero")]
    ZeroTimeUnit,
    #[error("maxVUs must be at least 1")]
    NoVus,
    #[error("maxVUs ({0}) exceeds the supported maximum ({max})", max = crate::pool::MAX_VUS)]
    TooManyVus(u64),
    #[error("preAllocatedVUs ({pre_allocated}) exceeds maxVUs ({max})")]
    PreAllocatedExceedsMax { pre_allocated: u64, max: u64 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("threshold on `{metric}`: {source}")]
    Threshold {
        metric: String,
        #[source]
        source: ThresholdParseError,
    },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error of a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("reporter failed: {0}")]
    Report(BoxError),
}
