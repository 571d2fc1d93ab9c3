//! # Window Counter
//!
//! Counts admissions per subject in fixed minute, hour and day windows.
//!
//! ## Window lifecycle
//!
//! ```text
//!     start ─────────── window_ms ───────────► start + window_ms
//!       │ count: 0 → 1 → 2 → ... ≤ limit        │
//!       │                                       ▼
//!       │                           next access: count = 0, start = now
//! ```
//!
//! Windows roll lazily: an expired window is reset the next time the subject
//! is touched, never by a timer. Subjects that stop sending are forgotten by
//! [`WindowCounter::sweep`], which the supervisor runs periodically.
//!
//! ## All-or-nothing charging
//!
//! ```text
//!     lock subject ──► roll expired tiers
//!                  ──► probe minute, hour, day (no mutation)
//!                  ──► gate (e.g. concurrency acquire)
//!                  ──► commit +1 to all three tiers
//!     unlock
//! ```
//!
//! A request that fails any probe, or the gate, is charged nothing.

use super::config::{RateLimitConfig, Scope, Tier};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Why a charge did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBlock {
    /// The tier had no headroom left in its current window.
    Exhausted(Tier),
    /// Every tier had headroom but the caller's gate refused.
    Gate,
}

#[derive(Debug, Clone, Copy)]
struct TierWindow {
    start_ms: u64,
    count: u32,
}

#[derive(Debug)]
struct SubjectWindows {
    tiers: [TierWindow; 3],
    last_seen_ms: u64,
}

impl SubjectWindows {
    fn new(now_ms: u64) -> Self {
        Self {
            tiers: [TierWindow {
                start_ms: now_ms,
                count: 0,
            }; 3],
            last_seen_ms: now_ms,
        }
    }

    /// Resets every tier whose window has elapsed. Returns how many rolled.
    fn roll(&mut self, now_ms: u64) -> u64 {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
        let mut rolled = 0;
        for tier in Tier::ALL {
            let window = &mut self.tiers[tier.index()];
            if now_ms.saturating_sub(window.start_ms) >= tier.window_ms() {
                window.start_ms = now_ms;
                window.count = 0;
                rolled += 1;
            }
        }
        rolled
    }

    fn first_exhausted(&self, config: &RateLimitConfig) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|&tier| self.tiers[tier.index()].count >= config.limit(tier))
    }

    /// `true` once no tier holds a count that still applies.
    fn all_elapsed(&self, now_ms: u64) -> bool {
        Tier::ALL.into_iter().all(|tier| {
            now_ms.saturating_sub(self.tiers[tier.index()].start_ms) >= tier.window_ms()
        })
    }

    fn commit(&mut self) {
        for window in &mut self.tiers {
            window.count = window.count.saturating_add(1);
        }
    }
}

/// Per-subject minute/hour/day counters.
///
/// Each subject has its own lock; subjects never contend with each other
/// beyond the `DashMap` shard lookup.
///
/// # Example
///
/// ```rust
/// use rater_admission::{RateLimitConfig, Scope, Tier, WindowCounter};
///
/// let windows = WindowCounter::new();
/// let user = Scope::user("u-1");
/// let cfg = RateLimitConfig::new(2, 100, 1000);
///
/// assert!(windows.try_consume_all(&user, &cfg, 0, || true).is_ok());
/// assert!(windows.try_consume_all(&user, &cfg, 0, || true).is_ok());
/// assert!(windows.try_consume_all(&user, &cfg, 0, || true).is_err());
/// assert_eq!(windows.count(&user, Tier::Hour, 0), 2);
/// ```
pub struct WindowCounter {
    subjects: DashMap<Scope, Arc<Mutex<SubjectWindows>>, ahash::RandomState>,
    total_rollovers: AtomicU64,
    total_evicted: AtomicU64,
}

impl WindowCounter {
    /// Creates an empty counter.
    pub fn new() -> Self {
        Self {
            subjects: DashMap::with_hasher(ahash::RandomState::new()),
            total_rollovers: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    fn slot(&self, subject: &Scope, now_ms: u64) -> Arc<Mutex<SubjectWindows>> {
        // Fast path: existing subject, shard read lock only
        if let Some(slot) = self.subjects.get(subject) {
            return slot.value().clone();
        }
        self.subjects
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SubjectWindows::new(now_ms))))
            .value()
            .clone()
    }

    fn record_rollovers(&self, subject: &Scope, rolled: u64) {
        if rolled > 0 {
            self.total_rollovers.fetch_add(rolled, Ordering::Relaxed);
            debug!(subject = %subject, tiers = rolled, "Rolled rate limit windows");
        }
    }

    /// Charges one request against a single tier if it has headroom.
    ///
    /// Returns `false` without touching the count when the tier is exhausted.
    pub fn try_consume(&self, subject: &Scope, tier: Tier, limit: u32, now_ms: u64) -> bool {
        let slot = self.slot(subject, now_ms);
        let mut windows = slot.lock();
        let rolled = windows.roll(now_ms);
        self.record_rollovers(subject, rolled);

        let window = &mut windows.tiers[tier.index()];
        if window.count < limit {
            window.count += 1;
            true
        } else {
            false
        }
    }

    /// Returns the first exhausted tier without charging anything.
    pub fn probe(&self, subject: &Scope, config: &RateLimitConfig, now_ms: u64) -> Option<Tier> {
        let slot = self.slot(subject, now_ms);
        let mut windows = slot.lock();
        let rolled = windows.roll(now_ms);
        self.record_rollovers(subject, rolled);
        windows.first_exhausted(config)
    }

    /// Charges all three tiers at once, or none.
    ///
    /// The `gate` runs while the subject's windows are locked and only after
    /// every tier has passed its probe. Its answer decides whether the charge
    /// is committed, so a concurrency acquire passed as the gate is atomic
    /// with the window check.
    pub fn try_consume_all<F>(
        &self,
        subject: &Scope,
        config: &RateLimitConfig,
        now_ms: u64,
        gate: F,
    ) -> Result<(), WindowBlock>
    where
        F: FnOnce() -> bool,
    {
        let slot = self.slot(subject, now_ms);
        let mut windows = slot.lock();
        let rolled = windows.roll(now_ms);
        self.record_rollovers(subject, rolled);

        if let Some(tier) = windows.first_exhausted(config) {
            return Err(WindowBlock::Exhausted(tier));
        }
        if !gate() {
            return Err(WindowBlock::Gate);
        }
        windows.commit();
        Ok(())
    }

    /// Current count for one tier, after rolling an expired window.
    pub fn count(&self, subject: &Scope, tier: Tier, now_ms: u64) -> u32 {
        match self.subjects.get(subject) {
            Some(slot) => {
                let slot = slot.value().clone();
                let mut windows = slot.lock();
                let rolled = windows.roll(now_ms);
                self.record_rollovers(subject, rolled);
                windows.tiers[tier.index()].count
            }
            None => 0,
        }
    }

    /// Forgets subjects not seen for `idle_ms` for which `is_busy` is false.
    ///
    /// Subjects whose state is held elsewhere at the moment of the sweep are
    /// kept, as are subjects with any window still open: forgetting a live
    /// day window would hand the subject a fresh budget early. Returns the
    /// number removed.
    pub fn sweep<F>(&self, now_ms: u64, idle_ms: u64, is_busy: F) -> usize
    where
        F: Fn(&Scope) -> bool,
    {
        let mut removed = 0;
        self.subjects.retain(|subject, slot| {
            if Arc::strong_count(slot) > 1 || is_busy(subject) {
                return true;
            }
            let idle = match slot.try_lock() {
                Some(windows) => {
                    now_ms.saturating_sub(windows.last_seen_ms) >= idle_ms
                        && windows.all_elapsed(now_ms)
                }
                None => false,
            };
            if idle {
                removed += 1;
            }
            !idle
        });

        if removed > 0 {
            self.total_evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Window sweep evicted {} idle subjects", removed);
        }
        removed
    }

    /// Number of subjects with live windows.
    pub fn tracked_subjects(&self) -> usize {
        self.subjects.len()
    }

    /// Lifetime count of tier windows that rolled over.
    pub fn total_rollovers(&self) -> u64 {
        self.total_rollovers.load(Ordering::Relaxed)
    }

    /// Lifetime count of subjects evicted by [`sweep`](Self::sweep).
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCounter")
            .field("tracked_subjects", &self.tracked_subjects())
            .field("total_rollovers", &self.total_rollovers())
            .finish()
    }
}
