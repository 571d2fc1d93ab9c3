//! # Concurrency Tracker
//!
//! Lock-free count of in-flight requests per subject, with an optional
//! engine-wide cap.
//!
//! ## Acquire / release
//!
//! ```text
//!     try_acquire(subject, cap):
//!
//!     subject counter ──CAS n → n+1 (n < cap)──► global counter ──CAS──► ✅
//!            │                                        │
//!            └── n == cap ──► ❌                        └── full ──► undo subject ──► ❌
//!
//!     release(subject):
//!
//!     subject counter ──CAS n → n-1 (n > 0)──► global counter -1 ──► ✅
//!            │
//!            └── n == 0 ──► double release: counted, logged, nothing changes
//! ```
//!
//! Counters never go negative. A release with no matching acquire is a
//! caller bug; it is surfaced through [`ConcurrencyTracker::double_releases`]
//! and a `warn!` and otherwise ignored.

use super::config::Scope;
use super::utils::{Backoff, CacheAligned};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Increments `counter` if it is below `cap`.
#[inline]
fn cas_increment(counter: &AtomicU32, cap: u32) -> bool {
    let mut backoff = Backoff::new();
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if current >= cap {
            return false;
        }
        match counter.compare_exchange_weak(
            current,
            current + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => {
                current = actual;
                backoff.snooze();
            }
        }
    }
}

/// Decrements `counter` if it is above zero.
#[inline]
fn cas_decrement(counter: &AtomicU32) -> bool {
    let mut backoff = Backoff::new();
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return false;
        }
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => {
                current = actual;
                backoff.snooze();
            }
        }
    }
}

/// Per-subject in-flight counters.
///
/// # Example
///
/// ```rust
/// use rater_admission::{ConcurrencyTracker, Scope};
///
/// let tracker = ConcurrencyTracker::new(None);
/// let user = Scope::user("u-1");
///
/// assert!(tracker.try_acquire(&user, 1));
/// assert!(!tracker.try_acquire(&user, 1));
/// assert!(tracker.release(&user));
/// assert!(!tracker.release(&user)); // double release
/// assert_eq!(tracker.double_releases(), 1);
/// ```
pub struct ConcurrencyTracker {
    in_flight: DashMap<Scope, Arc<AtomicU32>, ahash::RandomState>,
    global: CacheAligned<AtomicU32>,
    global_limit: Option<u32>,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    double_releases: AtomicU64,
}

impl ConcurrencyTracker {
    /// Creates a tracker, optionally capping the sum over all subjects.
    pub fn new(global_limit: Option<u32>) -> Self {
        Self {
            in_flight: DashMap::with_hasher(ahash::RandomState::new()),
            global: CacheAligned::new(AtomicU32::new(0)),
            global_limit,
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
        }
    }

    fn counter(&self, subject: &Scope) -> Arc<AtomicU32> {
        if let Some(counter) = self.in_flight.get(subject) {
            return counter.value().clone();
        }
        self.in_flight
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .value()
            .clone()
    }

    /// Takes one slot for `subject` if it has fewer than `cap` in flight and
    /// the global cap, if any, has room.
    pub fn try_acquire(&self, subject: &Scope, cap: u32) -> bool {
        let counter = self.counter(subject);
        if !cas_increment(&counter, cap) {
            return false;
        }

        if let Some(limit) = self.global_limit {
            if !cas_increment(self.global.get(), limit) {
                cas_decrement(&counter);
                debug!(subject = %subject, limit, "Global concurrency cap reached");
                return false;
            }
        } else {
            self.global.get().fetch_add(1, Ordering::AcqRel);
        }

        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Returns one slot for `subject`.
    ///
    /// Returns `false`, and leaves every counter untouched, when the subject
    /// has nothing in flight.
    pub fn release(&self, subject: &Scope) -> bool {
        let released = match self.in_flight.get(subject) {
            Some(counter) => cas_decrement(counter.value()),
            None => false,
        };

        if !released {
            let total = self.double_releases.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(subject = %subject, total, "Release without a matching acquire ignored");
            return false;
        }

        cas_decrement(self.global.get());
        self.total_released.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Requests currently in flight for `subject`.
    pub fn in_flight(&self, subject: &Scope) -> u32 {
        self.in_flight
            .get(subject)
            .map(|c| c.value().load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Requests currently in flight across every subject.
    pub fn total_in_flight(&self) -> u32 {
        self.global.get().load(Ordering::Acquire)
    }

    /// `true` when a global cap is configured and reached.
    pub fn is_globally_saturated(&self) -> bool {
        match self.global_limit {
            Some(limit) => self.total_in_flight() >= limit,
            None => false,
        }
    }

    /// The configured global cap.
    pub fn global_limit(&self) -> Option<u32> {
        self.global_limit
    }

    /// Lifetime count of releases that had no matching acquire.
    pub fn double_releases(&self) -> u64 {
        self.double_releases.load(Ordering::Relaxed)
    }

    /// Lifetime count of successful acquires.
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    /// Lifetime count of successful releases.
    pub fn total_released(&self) -> u64 {
        self.total_released.load(Ordering::Relaxed)
    }

    /// Drops counters for subjects with nothing in flight and no other holder.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.in_flight.retain(|_, counter| {
            let idle = Arc::strong_count(counter) == 1 && counter.load(Ordering::Acquire) == 0;
            if idle {
                removed += 1;
            }
            !idle
        });
        removed
    }

    /// Number of subjects with a counter.
    pub fn tracked_subjects(&self) -> usize {
        self.in_flight.len()
    }
}

impl std::fmt::Debug for ConcurrencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyTracker")
            .field("total_in_flight", &self.total_in_flight())
            .field("global_limit", &self.global_limit)
            .field("double_releases", &self.double_releases())
            .finish()
    }
}
