//! # Utility Functions (utils.rs)
//!
//! Time sources and low-level helpers shared by the admission components.
//!
//! ## Time
//!
//! Every window, timeout and wait-time sample is measured through a [`Clock`].
//! Production engines use [`SystemClock`], which is anchored on a monotonic
//! `Instant` so wall-clock jumps never reopen or extend a window. Tests and
//! demos inject a [`ManualClock`] and advance it explicitly.
//!
//! ```text
//!     Clock sources:
//!
//!     SystemClock ──► current_time_ms() ──► epoch ms captured once,
//!                                           advanced by Instant
//!     ManualClock ──► AtomicU64          ──► advanced by the test
//! ```
//!
//! ## Spinning
//!
//! The concurrency tracker uses compare-and-swap loops. Under contention they
//! back off with [`cpu_relax`] (PAUSE on x86_64, YIELD on ARM) and finally yield
//! to the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Wall-clock epoch milliseconds captured at first use, advanced by a
// monotonic Instant afterwards.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// CPU-specific relaxation hint for spin loops.
///
/// - **x86_64**: PAUSE instruction
/// - **ARM64**: YIELD instruction
/// - **Others**: standard spin loop hint
#[inline(always)]
pub fn cpu_relax() {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(any(target_feature = "sse2", target_feature = "sse"))]
        unsafe {
            std::arch::x86_64::_mm_pause();
        }
        #[cfg(not(any(target_feature = "sse2", target_feature = "sse")))]
        {
            std::hint::spin_loop();
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::hint::spin_loop();
    }
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// The epoch offset is sampled once; later calls advance it with a monotonic
/// `Instant`, so the returned value never goes backwards.
///
/// # Example
///
/// ```rust
/// use rater_admission::current_time_ms;
///
/// let a = current_time_ms();
/// let b = current_time_ms();
/// assert!(b >= a);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        (Instant::now(), u64::try_from(epoch_ms).unwrap_or(u64::MAX))
    });
    base_ms.saturating_add(duration_ms(start.elapsed()))
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Source of "now" for windows, queue deadlines and wait-time samples.
///
/// Implementations must be monotonic: `now_ms` never returns a smaller value
/// than a previous call.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by [`current_time_ms`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// A clock that only moves when told to.
///
/// Useful for exercising minute/hour/day windows and queue timeouts without
/// sleeping.
///
/// # Example
///
/// ```rust
/// use rater_admission::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now_ms(), 61_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = duration_ms(by);
        let _ = self
            .now_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                Some(now.saturating_add(by))
            });
    }

    /// Moves the clock to `ms`. Earlier values are ignored to keep the clock
    /// monotonic.
    pub fn set(&self, ms: u64) {
        self.now_ms.fetch_max(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Cache-aligned wrapper to keep a hot atomic on its own cache line.
///
/// The engine-wide in-flight counter is touched by every admission and
/// release across all identities; aligning it avoids false sharing with the
/// neighbouring configuration fields.
#[cfg(target_arch = "aarch64")]
#[repr(C, align(128))]
pub(crate) struct CacheAligned<T>(pub T);
#[cfg(not(target_arch = "aarch64"))]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub(crate) fn get(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Exponential backoff for CAS retry loops.
///
/// ```text
///     Attempt 1: spin 1
///     Attempt 2: spin 2
///     Attempt 3: spin 4
///     Attempt 4: spin 8
///     Attempt 5+: yield to scheduler
/// ```
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step < 4 {
            for _ in 0..(1u32 << self.step) {
                cpu_relax();
            }
        } else {
            std::thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }
}
