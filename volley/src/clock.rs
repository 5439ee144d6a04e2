//! Time sources for the scheduling and evaluation loops.
//!
//! The dispatcher, every iteration task, the threshold loop and the drain all
//! read and wait on the same [`Clock`]. [`TokioClock`] is backed by
//! [`tokio::time`], so a test under `#[tokio::test(start_paused = true)]` gets
//! a virtual clock for free. [`ManualClock`] only moves when a driver calls
//! [`advance`](ManualClock::advance) or [`drive`](ManualClock::drive), which
//! lets a whole run be stepped through deterministically.
use std::{
    future::Future,
    pin::pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

/// How often [`ManualClock::drive`] yields to other tasks between steps.
const YIELDS_PER_STEP: usize = 8;

/// A monotonic time source that can also wait.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Resolve once `now() >= deadline`.
    fn sleep_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send;

    /// Resolve once `duration` has passed. A deadline too far away to be
    /// represented never resolves.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let deadline = self.now().checked_add(duration);
        let clock = self.clone();
        async move {
            match deadline {
                Some(deadline) => clock.sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }
}

/// The default clock, backed by the Tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send {
        tokio::time::sleep_until(deadline)
    }
}

/// A stepped clock that only moves when asked to.
///
/// Sleepers park until a driver moves the clock past their deadline. Anything
/// that has to wait during a run driven by this clock must wait on it,
/// including the iteration callback; a callback sleeping on the Tokio timer
/// while the clock is driven will be overtaken by the drain deadline.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<watch::Sender<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (offset, _) = watch::channel(Duration::ZERO);
        Self {
            origin: Instant::now(),
            offset: Arc::new(offset),
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        self.offset.send_modify(|offset| *offset += by);
    }

    /// Time travelled since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.borrow()
    }

    /// Poll `fut` to completion, advancing the clock by `step` whenever it is
    /// still pending after the other tasks on the runtime had a chance to run.
    pub async fn drive<F: Future>(&self, step: Duration, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        loop {
            if let Poll::Ready(out) = futures::poll!(fut.as_mut()) {
                return out;
            }
            for _ in 0..YIELDS_PER_STEP {
                tokio::task::yield_now().await;
            }
            self.advance(step);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.borrow()
    }

    fn sleep_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send {
        let mut offset = self.offset.subscribe();
        let target = deadline.saturating_duration_since(self.origin);
        async move {
            // an error means every handle on the clock is gone, so nobody can wake us
            let _ = offset.wait_for(|offset| *offset >= target).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_sleep_waits_for_the_driver() {
        let clock = ManualClock::new();
        let deadline = clock.now() + Duration::from_secs(5);
        let sleeper = tokio::spawn({
            let clock = clock.clone();
            async move { clock.sleep_until(deadline).await }
        });

        clock.advance(Duration::from_secs(3));
        for _ in 0..YIELDS_PER_STEP {
            tokio::task::yield_now().await;
        }
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(2));
        sleeper.await.unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn past_deadlines_resolve_immediately() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(10));
        clock.sleep_until(start + Duration::from_secs(3)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn drive_steps_until_done() {
        let clock = ManualClock::new();
        let sleeping = clock.clone();
        clock
            .drive(Duration::from_millis(100), async move {
                sleeping.sleep(Duration::from_secs(2)).await;
            })
            .await;
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_sleeps_never_resolve() {
        let forever = TokioClock.sleep(Duration::MAX);
        assert!(tokio::time::timeout(Duration::from_secs(3600), forever).await.is_err());
    }
}
