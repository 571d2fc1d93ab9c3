//! # Engine Metrics
//!
//! Counters and health analysis for the admission engine, plus the queue
//! telemetry shown on the admin panel.
//!
//! ## Metrics Overview
//!
//! ```text
//!     Admission Dashboard:
//!     ┌─────────────────────────────────────┐
//!     │  Admitted:  940 (direct 880)        │
//!     │  Rejected:   12 (full 10, timeout 2)│
//!     │                                     │
//!     │  Queue: ▓▓▓▓░░░░░░░░░░  (41/1000)   │
//!     │  Process time: 1.25s                │
//!     │                                     │
//!     │  Health: ✅ Healthy                 │
//!     └─────────────────────────────────────┘
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated on the hot path.
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) admitted_direct: AtomicU64,
    pub(crate) admitted_from_queue: AtomicU64,
    pub(crate) admitted_unlimited: AtomicU64,
    pub(crate) queued: AtomicU64,
    pub(crate) rejected_queue_full: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) cleared: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) drains: AtomicU64,
}

impl EngineStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Queue state as reported to operators.
///
/// `process_time_estimate` is the smoothed time, in seconds, between an entry
/// being queued and being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueTelemetry {
    /// Entries waiting right now.
    pub queue_size: usize,
    /// Configured bound.
    pub max_size: usize,
    /// Average queued-to-admitted time in seconds.
    pub process_time_estimate: f64,
}

impl QueueTelemetry {
    /// Fraction of the queue in use, 0.0 to 1.0.
    #[inline]
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.queue_size as f64 / self.max_size as f64
        }
    }
}

/// Snapshot of everything the engine counts.
///
/// ## Key Metrics Explained
///
/// ### Outcomes
/// - **admitted_direct**: admitted on arrival
/// - **admitted_from_queue**: admitted by a drain after waiting
/// - **admitted_unlimited**: bypassed every limit
/// - **rejected_queue_full / timed_out / cleared**: the three rejection paths
///
/// ### Anomalies
/// - **double_releases**: releases with no matching acquire; any non-zero
///   value is a caller bug
///
/// # Example
///
/// ```rust
/// use rater_admission::{AdmissionEngine, HealthStatus, Identity};
///
/// let engine = AdmissionEngine::new();
/// let _permit = engine.submit(&Identity::user("u"));
///
/// let metrics = engine.metrics();
/// assert_eq!(metrics.total_admitted(), 1);
/// assert_eq!(metrics.health_status(), HealthStatus::Healthy);
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    /// Calls to `submit`.
    pub total_submitted: u64,
    /// Admitted on arrival.
    pub admitted_direct: u64,
    /// Admitted after waiting in the queue.
    pub admitted_from_queue: u64,
    /// Admitted through an unlimited record.
    pub admitted_unlimited: u64,
    /// Entries that went into the queue.
    pub total_queued: u64,
    /// Rejected because the queue was full.
    pub rejected_queue_full: u64,
    /// Queued entries that hit their max wait.
    pub timed_out: u64,
    /// Queued entries discarded by an administrator.
    pub cleared: u64,
    /// Queued entries withdrawn by their caller.
    pub cancelled: u64,
    /// Releases without a matching acquire.
    pub double_releases: u64,
    /// Entries waiting right now.
    pub queue_size: usize,
    /// Queue bound.
    pub max_queue_size: usize,
    /// Requests in flight over every subject.
    pub in_flight: u32,
    /// Subjects with live window state.
    pub tracked_subjects: usize,
    /// Tier windows that rolled over.
    pub window_rollovers: u64,
    /// Subjects forgotten by idle sweeps.
    pub evicted_subjects: u64,
    /// Drain passes that found a non-empty queue.
    pub drain_passes: u64,
    /// Smoothed queued-to-admitted time in seconds.
    pub process_time_estimate: f64,
}

impl EngineMetrics {
    /// Every admission, however it happened.
    #[inline]
    pub fn total_admitted(&self) -> u64 {
        self.admitted_direct + self.admitted_from_queue + self.admitted_unlimited
    }

    /// Every rejection, whatever the reason.
    #[inline]
    pub fn total_rejected(&self) -> u64 {
        self.rejected_queue_full + self.timed_out + self.cleared
    }

    /// Share of decided requests that were rejected, 0.0 to 1.0.
    #[inline]
    pub fn rejection_rate(&self) -> f64 {
        let decided = self.total_admitted() + self.total_rejected();
        if decided == 0 {
            0.0
        } else {
            self.total_rejected() as f64 / decided as f64
        }
    }

    /// Share of submissions that had to wait.
    #[inline]
    pub fn queueing_rate(&self) -> f64 {
        if self.total_submitted == 0 {
            0.0
        } else {
            self.total_queued as f64 / self.total_submitted as f64
        }
    }

    /// Fraction of the queue in use, 0.0 to 1.0.
    #[inline]
    pub fn queue_utilization(&self) -> f64 {
        if self.max_queue_size == 0 {
            0.0
        } else {
            self.queue_size as f64 / self.max_queue_size as f64
        }
    }

    /// Half the queue or more in use, or one rejection in ten.
    #[inline]
    pub fn is_under_pressure(&self) -> bool {
        self.queue_utilization() >= 0.5 || self.rejection_rate() > 0.1
    }

    /// Queue nearly full, or most decisions are rejections.
    #[inline]
    pub fn is_under_sustained_pressure(&self) -> bool {
        self.queue_utilization() >= 0.9 || self.rejection_rate() > 0.5
    }

    /// Three-level assessment of the engine.
    ///
    /// Double releases never make the engine critical on their own, but they
    /// mark it degraded until someone looks at the caller.
    pub fn health_status(&self) -> HealthStatus {
        if self.is_under_sustained_pressure() {
            HealthStatus::Critical
        } else if self.is_under_pressure() || self.double_releases > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Human-readable report.
    ///
    /// # Example Output
    ///
    /// ```text
    /// AdmissionEngine Metrics:
    /// ├─ Admissions:
    /// │  ├─ Direct: 880
    /// │  ├─ From Queue: 55
    /// │  └─ Unlimited: 5
    /// ├─ Rejections:
    /// │  ├─ Queue Full: 10
    /// │  ├─ Timed Out: 2
    /// │  └─ Cleared: 0
    /// ├─ Queue:
    /// │  ├─ Size: 41/1000
    /// │  ├─ Drain Passes: 312
    /// │  └─ Process Time: 1.250s
    /// └─ Health:
    ///    ├─ Status: Healthy
    ///    └─ Double Releases: 0
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "AdmissionEngine Metrics:\n\
             ├─ Admissions:\n\
             │  ├─ Direct: {}\n\
             │  ├─ From Queue: {}\n\
             │  └─ Unlimited: {}\n\
             ├─ Rejections:\n\
             │  ├─ Queue Full: {}\n\
             │  ├─ Timed Out: {}\n\
             │  ├─ Cleared: {}\n\
             │  └─ Rejection Rate: {:.2}%\n\
             ├─ Queue:\n\
             │  ├─ Size: {}/{}\n\
             │  ├─ Cancelled: {}\n\
             │  ├─ Drain Passes: {}\n\
             │  └─ Process Time: {:.3}s\n\
             ├─ Subjects:\n\
             │  ├─ Tracked: {}\n\
             │  ├─ In Flight: {}\n\
             │  └─ Evicted: {}\n\
             └─ Health:\n\
                ├─ Status: {:?}\n\
                └─ Double Releases: {}",
            self.admitted_direct,
            self.admitted_from_queue,
            self.admitted_unlimited,
            self.rejected_queue_full,
            self.timed_out,
            self.cleared,
            self.rejection_rate() * 100.0,
            self.queue_size,
            self.max_queue_size,
            self.cancelled,
            self.drain_passes,
            self.process_time_estimate,
            self.tracked_subjects,
            self.in_flight,
            self.evicted_subjects,
            self.health_status(),
            self.double_releases,
        )
    }
}

impl fmt::Display for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Health status of the engine.
///
/// ```text
///     Healthy ──────► queue mostly empty, few rejections
///        │
///     Degraded ─────► queue half full, rejections climbing, or double releases
///        │
///     Critical ─────► queue nearly full or most requests rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Under some pressure, or a caller is misbehaving.
    Degraded,
    /// Backpressure is rejecting most traffic.
    Critical,
}

impl HealthStatus {
    /// Returns true if the status indicates any problems.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Suggested operator action.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely, check limits and caller release paths",
            Self::Critical => "Immediate action required: raise limits or clear the queue",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Critical => write!(f, "🔴 Critical"),
        }
    }
}
