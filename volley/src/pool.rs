//! Elastic pool of virtual users.
//!
//! Concurrency is bounded by a [`Semaphore`] holding `max` permits; a permit is
//! taken for the whole lifetime of a [`VuSlot`] and returned when the slot is
//! dropped. Idle virtual users are kept on a deque so the most recently used
//! one is handed out first and the longest idle ones can be reaped from the
//! front once the pool has grown past its pre-allocated size.
//!
//! The pool has no clock of its own. A VU's idle time starts at the first
//! [`WorkerPool::reap_idle`] call that finds it idle, so reaping follows
//! whatever time source the caller passes in, at the caller's cadence.
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use typed_builder::TypedBuilder;

/// The semaphore reserves 3 bits of `usize` for flags, so this is the largest
/// pool it can bound.
pub const MAX_VUS: u64 = (usize::MAX >> 3) as u64;

/// Sizing of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, TypedBuilder)]
pub struct PoolSettings {
    /// VUs created eagerly and never reaped
    pub pre_allocated: u64,
    /// Hard cap on concurrently active VUs
    pub max: u64,
    /// How long a VU above `pre_allocated` may sit idle before it is destroyed
    #[builder(default = Duration::from_secs(30))]
    pub idle_timeout: Duration,
}

#[derive(Debug)]
struct IdleVu {
    id: u64,
    /// Stamped by the first reap pass that sees the VU idle
    since: Option<Instant>,
}

struct Inner {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleVu>>,
    allocated: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
    next_id: AtomicU64,
    settings: PoolSettings,
}

impl Inner {
    fn new_vu(&self) -> u64 {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Bounded, reusable set of execution slots shared by the dispatcher and every
/// running iteration.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Create the pool with `pre_allocated` VUs already warm.
    ///
    /// `settings` must already be validated (`pre_allocated <= max <= MAX_VUS`).
    pub fn new(settings: PoolSettings) -> Self {
        let inner = Inner {
            permits: Arc::new(Semaphore::new(settings.max as usize)),
            idle: Mutex::new(VecDeque::with_capacity(settings.pre_allocated as usize)),
            allocated: AtomicU64::new(0),
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            settings,
        };

        {
            let mut idle = inner.idle.lock();
            for _ in 0..settings.pre_allocated {
                let id = inner.new_vu();
                idle.push_back(IdleVu { id, since: None });
            }
        }
        tracing::debug!(
            "Pre-allocated {} VUs (max {})",
            settings.pre_allocated,
            settings.max
        );

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Take a slot without waiting.
    ///
    /// Returns `None` when `max` slots are already active or the pool is closed.
    pub fn try_acquire(&self) -> Option<VuSlot> {
        let permit = Arc::clone(&self.inner.permits).try_acquire_owned().ok()?;

        let reused = self.inner.idle.lock().pop_back();
        let id = match reused {
            Some(vu) => vu.id,
            None => {
                let id = self.inner.new_vu();
                tracing::debug!("VU {id} created on demand");
                id
            }
        };

        let active = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(active, Ordering::Relaxed);

        Some(VuSlot {
            id,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Give a slot back. Equivalent to dropping it.
    pub fn release(&self, slot: VuSlot) {
        drop(slot);
    }

    /// Destroy VUs above `pre_allocated` that have been idle longer than the
    /// configured timeout, as of `now`. Returns how many were destroyed.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let settings = &self.inner.settings;
        let mut idle = self.inner.idle.lock();
        let mut reaped = 0;

        // returns land at the back, so unstamped VUs are always a suffix
        for vu in idle.iter_mut().rev() {
            if vu.since.is_some() {
                break;
            }
            vu.since = Some(now);
        }

        while self.inner.allocated.load(Ordering::Relaxed) > settings.pre_allocated {
            let expired = idle
                .front()
                .and_then(|vu| vu.since)
                .is_some_and(|since| now.saturating_duration_since(since) > settings.idle_timeout);
            if !expired {
                break;
            }
            if let Some(vu) = idle.pop_front() {
                tracing::debug!("VU {} reaped after idling", vu.id);
                self.inner.allocated.fetch_sub(1, Ordering::Relaxed);
                reaped += 1;
            }
        }
        reaped
    }

    /// Refuse every future `try_acquire`. Slots already handed out stay valid.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Slots currently handed out.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// VUs in existence, idle or active.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Highest `active_count` observed so far.
    pub fn peak(&self) -> u64 {
        self.inner.peak.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }
}

/// Exclusive use of one virtual user. Returned to the pool on drop.
pub struct VuSlot {
    id: u64,
    pool: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl VuSlot {
    /// Identity of the VU, for diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for VuSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuSlot").field("id", &self.id).finish()
    }
}

impl Drop for VuSlot {
    fn drop(&mut self) {
        self.pool.idle.lock().push_back(IdleVu {
            id: self.id,
            since: None,
        });
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pre_allocated: u64, max: u64) -> WorkerPool {
        WorkerPool::new(
            PoolSettings::builder()
                .pre_allocated(pre_allocated)
                .max(max)
                .build(),
        )
    }

    #[tokio::test]
    async fn pre_allocates_warm_vus() {
        let pool = pool(5, 10);
        assert_eq!(pool.allocated(), 5);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn acquire_fails_at_max() {
        let pool = pool(1, 3);
        let slots: Vec<_> = (0..3).filter_map(|_| pool.try_acquire()).collect();
        assert_eq!(slots.len(), 3);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 3);
        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.peak(), 3);

        drop(slots);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn released_vus_are_reused() {
        let pool = pool(0, 4);
        let slot = pool.try_acquire().unwrap();
        let id = slot.id();
        pool.release(slot);
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.allocated(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaps_only_above_pre_allocated() {
        let pool = pool(1, 4);
        let slots: Vec<_> = (0..4).filter_map(|_| pool.try_acquire()).collect();
        drop(slots);
        assert_eq!(pool.allocated(), 4);

        assert_eq!(pool.reap_idle(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.reap_idle(Instant::now()), 3);
        assert_eq!(pool.allocated(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn idle_time_follows_the_callers_clock() {
        let pool = pool(0, 2);
        drop(pool.try_acquire());
        let origin = Instant::now();

        // first sighting only starts the idle timer
        assert_eq!(pool.reap_idle(origin + Duration::from_secs(100)), 0);
        assert_eq!(pool.reap_idle(origin + Duration::from_secs(120)), 0);
        assert_eq!(pool.reap_idle(origin + Duration::from_secs(131)), 1);
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_new_slots() {
        let pool = pool(2, 2);
        let held = pool.try_acquire().unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.try_acquire().is_none());
        drop(held);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 0);
    }
}
