//! Target arrival rate as a function of elapsed time.
//!
//! A [`RateSchedule`] is built once from either a constant rate or a list of
//! [`Stage`]s and is immutable afterwards. Each stage linearly interpolates from
//! the previous stage's target to its own over its duration:
//!
//! ```text
//! t = (elapsed - stage_start) / stage_duration
//! r(t) = start_rate + (end_rate - start_rate) * t
//! ```
//!
//! Since the curve is piecewise-linear, the number of iterations due over any
//! window is its exact trapezoidal area, see [`RateSchedule::starts_between`].
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{config::human_duration, error::ConfigError};

/// A stage defines a target rate and how long to ramp to that target.
///
/// `Stage::new(Duration::from_secs(10), 100)` ramps to 100 iterations per time
/// unit over 10s. A stage with `Duration::ZERO` jumps to `target` instantly and
/// holds no time of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "human_duration")]
    pub duration: Duration,
    /// Iterations per time unit
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// One linear piece of the curve, in iterations per second.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Segment {
    start: Duration,
    end: Duration,
    from: f64,
    to: f64,
    /// Index of the stage this segment came from
    stage: usize,
}

impl Segment {
    fn rate_at(&self, elapsed: Duration) -> f64 {
        let span = (self.end - self.start).as_secs_f64();
        let t = ((elapsed.saturating_sub(self.start)).as_secs_f64() / span).min(1.0);
        (self.from + (self.to - self.from) * t).max(0.0)
    }
}

/// Piecewise-linear, non-negative target rate over a fixed total duration.
#[derive(Clone, Debug, PartialEq)]
pub struct RateSchedule {
    segments: Vec<Segment>,
    total: Duration,
    stages: usize,
}

impl RateSchedule {
    /// A fixed `rate` per `time_unit` held for `duration`.
    pub fn constant(rate: u64, time_unit: Duration, duration: Duration) -> Result<Self, ConfigError> {
        Self::ramping(rate, time_unit, &[Stage::new(duration, rate)])
    }

    /// Start at `start_rate` per `time_unit` and walk through `stages` in order.
    pub fn ramping(start_rate: u64, time_unit: Duration, stages: &[Stage]) -> Result<Self, ConfigError> {
        if time_unit.is_zero() {
            return Err(ConfigError::ZeroTimeUnit);
        }
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }

        let unit = time_unit.as_secs_f64();
        let mut segments = Vec::with_capacity(stages.len());
        let mut rate = start_rate as f64 / unit;
        let mut cursor = Duration::ZERO;

        for (i, stage) in stages.iter().enumerate() {
            let target = stage.target as f64 / unit;
            if !stage.duration.is_zero() {
                segments.push(Segment {
                    start: cursor,
                    end: cursor + stage.duration,
                    from: rate,
                    to: target,
                    stage: i,
                });
                cursor += stage.duration;
            }
            rate = target;
        }

        if cursor.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }

        Ok(Self {
            segments,
            total: cursor,
            stages: stages.len(),
        })
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Number of configured stages, zero-duration ones included.
    pub fn stage_count(&self) -> usize {
        self.stages
    }

    fn segment(&self, elapsed: Duration) -> Option<&Segment> {
        if elapsed >= self.total {
            return None;
        }
        // first segment ending strictly after `elapsed`: a boundary belongs to the later stage
        let idx = self.segments.partition_point(|s| s.end <= elapsed);
        self.segments.get(idx)
    }

    /// Instantaneous target rate, in iterations per second.
    ///
    /// Returns 0 once the schedule is exhausted.
    pub fn target_rate(&self, elapsed: Duration) -> f64 {
        self.segment(elapsed).map_or(0.0, |s| s.rate_at(elapsed))
    }

    /// Index of the stage active at `elapsed`, or `None` once exhausted.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        self.segment(elapsed).map(|s| s.stage)
    }

    /// Integral of the target rate over `[from, to]`: how many iterations
    /// should have been started in that window.
    pub fn starts_between(&self, from: Duration, to: Duration) -> f64 {
        let to = to.min(self.total);
        if to <= from {
            return 0.0;
        }

        self.segments
            .iter()
            .filter(|s| s.end > from && s.start < to)
            .map(|s| {
                let a = from.max(s.start);
                let b = to.min(s.end);
                let width = (b - a).as_secs_f64();
                (s.rate_at(a) + s.rate_at(b)) / 2.0 * width
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn constant_holds_until_duration() {
        let s = RateSchedule::constant(100, SECOND, secs(10.0)).unwrap();
        assert_eq!(s.target_rate(Duration::ZERO), 100.0);
        assert_eq!(s.target_rate(secs(9.999)), 100.0);
        assert_eq!(s.target_rate(secs(10.0)), 0.0);
        assert_eq!(s.target_rate(secs(60.0)), 0.0);
        assert_eq!(s.total_duration(), secs(10.0));
    }

    #[test]
    fn time_unit_scales_rate() {
        let s = RateSchedule::constant(120, Duration::from_secs(60), secs(60.0)).unwrap();
        assert!(close(s.target_rate(secs(1.0)), 2.0));
    }

    #[test]
    fn ramp_interpolates_inside_second_stage() {
        let stages = [Stage::new(secs(5.0), 2000), Stage::new(secs(5.0), 4000)];
        let s = RateSchedule::ramping(1000, SECOND, &stages).unwrap();
        assert!(close(s.target_rate(secs(7.5)), 3000.0));
        assert!(close(s.target_rate(secs(2.5)), 1500.0));
        assert_eq!(s.stage_at(secs(7.5)), Some(1));
    }

    #[test]
    fn boundary_belongs_to_later_stage() {
        let stages = [Stage::new(secs(5.0), 2000), Stage::new(secs(5.0), 4000)];
        let s = RateSchedule::ramping(0, SECOND, &stages).unwrap();
        assert_eq!(s.stage_at(secs(5.0)), Some(1));
        assert!(close(s.target_rate(secs(5.0)), 2000.0));
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let stages = [
            Stage::new(secs(2.0), 10),
            Stage::new(Duration::ZERO, 100),
            Stage::new(secs(2.0), 100),
        ];
        let s = RateSchedule::ramping(10, SECOND, &stages).unwrap();
        assert!(close(s.target_rate(secs(1.999)), 10.0));
        assert!(close(s.target_rate(secs(2.0)), 100.0));
        assert_eq!(s.stage_at(secs(2.0)), Some(2));
        assert_eq!(s.total_duration(), secs(4.0));
    }

    #[test]
    fn trailing_ramp_down_reaches_zero() {
        let stages = [Stage::new(secs(10.0), 100), Stage::new(secs(10.0), 0)];
        let s = RateSchedule::ramping(100, SECOND, &stages).unwrap();
        assert!(close(s.target_rate(secs(15.0)), 50.0));
        assert!(s.target_rate(secs(19.99)) < 1.0);
        assert_eq!(s.target_rate(secs(20.0)), 0.0);
    }

    #[test]
    fn integral_is_trapezoidal_area() {
        let stages = [Stage::new(secs(10.0), 100)];
        let s = RateSchedule::ramping(0, SECOND, &stages).unwrap();
        assert!(close(s.starts_between(Duration::ZERO, secs(10.0)), 500.0));
        assert!(close(s.starts_between(secs(5.0), secs(10.0)), 375.0));
    }

    #[test]
    fn integral_spans_stage_boundaries() {
        let stages = [Stage::new(secs(5.0), 2000), Stage::new(secs(5.0), 4000)];
        let s = RateSchedule::ramping(0, SECOND, &stages).unwrap();
        let whole = s.starts_between(Duration::ZERO, secs(10.0));
        let split = s.starts_between(Duration::ZERO, secs(4.0)) + s.starts_between(secs(4.0), secs(10.0));
        assert!(close(whole, 20_000.0));
        assert!(close(whole, split));
    }

    #[test]
    fn integral_is_clamped_to_schedule() {
        let s = RateSchedule::constant(10, SECOND, secs(1.0)).unwrap();
        assert!(close(s.starts_between(Duration::ZERO, secs(100.0)), 10.0));
        assert_eq!(s.starts_between(secs(2.0), secs(3.0)), 0.0);
        assert_eq!(s.starts_between(secs(0.5), secs(0.5)), 0.0);
    }

    #[test]
    fn rejects_degenerate_schedules() {
        assert!(matches!(
            RateSchedule::ramping(0, SECOND, &[]),
            Err(ConfigError::EmptySchedule)
        ));
        assert!(matches!(
            RateSchedule::ramping(0, SECOND, &[Stage::new(Duration::ZERO, 10)]),
            Err(ConfigError::ZeroDuration)
        ));
        assert!(matches!(
            RateSchedule::constant(10, Duration::ZERO, SECOND),
            Err(ConfigError::ZeroTimeUnit)
        ));
    }
}
