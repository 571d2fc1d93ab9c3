//! # Admission Controller
//!
//! The [`AdmissionEngine`] decides, for every incoming request, whether it
//! runs now, waits, or is turned away.
//!
//! ## Decision Flow
//!
//! ```text
//!     submit(identity)
//!         │
//!         ├─► resolve config (api key > user > default > fallback)
//!         │
//!         ├─► unlimited? ────────────────────────────► Admitted (bypass)
//!         │
//!         ├─► own entries already queued? ──────────┐
//!         │                                          │
//!         ├─► probe minute/hour/day ──exhausted──────┤
//!         ├─► acquire concurrency slot ──full────────┤
//!         ├─► commit window charges ─────────────────► Admitted(Permit)
//!         │                                          │
//!         │                                          ▼
//!         │                                   enqueue ──full──► Rejected(QueueFull)
//!         │                                          │
//!         └──────────────────────────────────────────► Queued(Ticket)
//! ```
//!
//! A request that is queued or rejected is charged nothing. Released slots
//! and config changes trigger a drain of the queue (see `supervisor.rs`).
//!
//! ## Ownership of a slot
//!
//! ```text
//!     Admitted(Permit) ──drop / release()──► slot returned, queue drained
//!            │
//!            └─detach()──► Scope ──engine.release(&scope)──► slot returned
//! ```

use super::concurrency::ConcurrencyTracker;
use super::config::{EngineConfig, Identity, RateLimitConfig, Scope, Tier};
use super::error::{AdminError, ConfigError};
use super::metrics::{EngineMetrics, EngineStats, QueueTelemetry};
use super::queue::{EntryId, PriorityQueue, QueueEntry, Ticket};
use super::store::{ConfigRecord, ConfigStore, ResolvedConfig};
use super::supervisor::ServiceTimeEstimator;
use super::utils::{duration_ms, Clock, SystemClock};
use super::window::{WindowBlock, WindowCounter};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The shared queue was at its bound.
    QueueFull,
    /// The entry waited longer than its max wait.
    Timeout,
    /// An operator cleared the queue.
    ClearedByAdministrator,
    /// The engine dropped the entry without deciding it.
    Shutdown,
}

impl RejectReason {
    /// Stable text for responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue full",
            Self::Timeout => "timeout",
            Self::ClearedByAdministrator => "cleared by administrator",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The right to run one request.
///
/// Dropping the permit, or calling [`release`](Self::release), returns the
/// concurrency slot exactly once. Permits issued through an unlimited record
/// hold no slot.
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit {
    subject: Scope,
    bypass: bool,
    released: bool,
    engine: Arc<EngineInner>,
}

impl Permit {
    pub(crate) fn new(subject: Scope, bypass: bool, engine: Arc<EngineInner>) -> Self {
        Self {
            subject,
            bypass,
            released: false,
            engine,
        }
    }

    /// The subject whose counters this permit was charged to.
    pub fn subject(&self) -> &Scope {
        &self.subject
    }

    /// `true` when admitted through an unlimited record.
    pub fn is_unlimited(&self) -> bool {
        self.bypass
    }

    /// Returns the slot now.
    pub fn release(mut self) {
        self.release_slot();
    }

    /// Gives up automatic release.
    ///
    /// Returns the scope the caller must later pass to
    /// [`AdmissionEngine::release`], or `None` for unlimited permits, which
    /// hold nothing to release.
    pub fn detach(mut self) -> Option<Scope> {
        self.released = true;
        if self.bypass {
            None
        } else {
            Some(self.subject.clone())
        }
    }

    fn release_slot(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.bypass {
            self.engine.release_slot(&self.subject);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release_slot();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("subject", &self.subject)
            .field("unlimited", &self.bypass)
            .field("released", &self.released)
            .finish()
    }
}

/// How a queued request ended.
#[derive(Debug)]
pub enum QueueOutcome {
    /// The request may run.
    Admitted(Permit),
    /// The request will not run.
    Rejected(RejectReason),
}

impl QueueOutcome {
    /// `true` for [`QueueOutcome::Admitted`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// The permit, if admitted.
    pub fn into_permit(self) -> Option<Permit> {
        match self {
            Self::Admitted(permit) => Some(permit),
            Self::Rejected(_) => None,
        }
    }

    /// The reason, if rejected.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Admitted(_) => None,
            Self::Rejected(reason) => Some(*reason),
        }
    }
}

/// Answer to [`AdmissionEngine::submit`].
#[must_use]
#[derive(Debug)]
pub enum AdmissionResult {
    /// Run now.
    Admitted(Permit),
    /// Wait; the ticket resolves later.
    Queued(Ticket),
    /// Don't run.
    Rejected(RejectReason),
}

impl AdmissionResult {
    /// `true` for [`AdmissionResult::Admitted`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// `true` for [`AdmissionResult::Queued`].
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    /// `true` for [`AdmissionResult::Rejected`].
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The reason, if rejected.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }

    /// The permit, if admitted.
    pub fn into_permit(self) -> Option<Permit> {
        match self {
            Self::Admitted(permit) => Some(permit),
            _ => None,
        }
    }

    /// The ticket, if queued.
    pub fn into_ticket(self) -> Option<Ticket> {
        match self {
            Self::Queued(ticket) => Some(ticket),
            _ => None,
        }
    }
}

/// Per-call overrides for [`AdmissionEngine::submit_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Max time to wait in the queue; `None` uses the engine default.
    pub max_wait: Option<Duration>,
}

impl SubmitOptions {
    /// Options with the engine defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the max wait.
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }
}

/// Shared state behind every engine handle, permit and ticket.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: ConfigStore,
    pub(crate) windows: WindowCounter,
    pub(crate) tracker: ConcurrencyTracker,
    pub(crate) queue: Mutex<PriorityQueue>,
    pub(crate) queue_len: AtomicUsize,
    pub(crate) stats: EngineStats,
    pub(crate) estimator: ServiceTimeEstimator,
    pub(crate) draining: AtomicBool,
    pub(crate) drain_requested: AtomicBool,
}

impl EngineInner {
    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[inline]
    pub(crate) fn sync_queue_len(&self, queue: &PriorityQueue) {
        self.queue_len.store(queue.len(), Ordering::Release);
    }

    /// Whether `subject` could be admitted right now under `config`.
    fn has_headroom(&self, subject: &Scope, config: &RateLimitConfig, now_ms: u64) -> bool {
        self.windows.probe(subject, config, now_ms).is_none()
            && self.tracker.in_flight(subject) < config.concurrent_requests
            && !self.tracker.is_globally_saturated()
    }

    pub(crate) fn release_slot(self: &Arc<Self>, subject: &Scope) -> bool {
        let released = self.tracker.release(subject);
        if released {
            debug!(subject = %subject, "Released slot");
            if self.config.drain_on_release {
                self.drain();
            }
        }
        released
    }

    /// Removes a still-queued entry on behalf of its caller.
    pub(crate) fn cancel_entry(&self, id: EntryId) -> bool {
        let removed = {
            let mut queue = self.queue.lock();
            let removed = queue.remove(id);
            self.sync_queue_len(&queue);
            removed
        };

        match removed {
            Some(entry) => {
                EngineStats::bump(&self.stats.cancelled);
                debug!(id, subject = %entry.subject, "Queued request cancelled");
                true
            }
            None => false,
        }
    }
}

/// The admission engine.
///
/// Cheap to clone; clones share all state.
///
/// # Example
///
/// ```rust
/// use rater_admission::{AdmissionEngine, AdmissionResult, Identity, RateLimitConfig, Scope};
///
/// let engine = AdmissionEngine::new();
/// engine
///     .create_config(
///         Scope::api_key("k-1"),
///         RateLimitConfig::new(2, 100, 1_000).with_concurrency(1),
///     )
///     .unwrap();
///
/// let caller = Identity::api_key("k-1");
/// let first = engine.submit(&caller);
/// assert!(first.is_admitted());
///
/// match engine.submit(&caller) {
///     AdmissionResult::Queued(ticket) => println!("wait ~{:?}", ticket.estimated_wait()),
///     other => panic!("expected to queue, got {:?}", other),
/// }
/// ```
#[derive(Clone)]
pub struct AdmissionEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl AdmissionEngine {
    /// Creates an engine with default settings and the system clock.
    pub fn new() -> Self {
        Self::with_clock(EngineConfig::default(), Arc::new(SystemClock))
    }

    /// Creates an engine with the given settings and the system clock.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails validation. Use
    /// [`try_with_config`](Self::try_with_config) to handle that instead.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::try_with_config(config).unwrap_or_else(|e| panic!("invalid engine config: {}", e))
    }

    /// Creates an engine with the given settings, validating them first.
    pub fn try_with_config(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_clock(config, Arc::new(SystemClock)))
    }

    /// Creates an engine reading time from `clock`.
    ///
    /// `config` must already be validated; outside the crate a custom clock
    /// goes through the builder, which checks it.
    pub(crate) fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_queue_size = config.max_queue_size,
            global_concurrent_limit = ?config.global_concurrent_limit,
            "Creating admission engine"
        );

        let inner = EngineInner {
            clock,
            store: ConfigStore::new(),
            windows: WindowCounter::new(),
            tracker: ConcurrencyTracker::new(config.global_concurrent_limit),
            queue: Mutex::new(PriorityQueue::new(config.max_queue_size)),
            queue_len: AtomicUsize::new(0),
            stats: EngineStats::default(),
            estimator: ServiceTimeEstimator::new(config.ewma_alpha),
            draining: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            config,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Asks to run one request for `identity`, with default options.
    pub fn submit(&self, identity: &Identity) -> AdmissionResult {
        self.submit_with(identity, SubmitOptions::default())
    }

    /// Asks to run one request for `identity`.
    ///
    /// Never blocks on the queue. Never fails: every outcome, including
    /// backpressure, is a value.
    pub fn submit_with(&self, identity: &Identity, options: SubmitOptions) -> AdmissionResult {
        let inner = &self.inner;
        EngineStats::bump(&inner.stats.submitted);

        let now = inner.now_ms();
        let resolved = inner.store.resolve(identity);
        let config = resolved.config();
        let subject = identity.subject();

        if config.is_unlimited {
            EngineStats::bump(&inner.stats.admitted_unlimited);
            debug!(identity = %identity, "Admitted through unlimited record");
            return AdmissionResult::Admitted(Permit::new(subject, true, inner.clone()));
        }

        let defer = inner.queue_len.load(Ordering::Acquire) > 0 && {
            let queue = inner.queue.lock();
            queue.should_defer(&subject, config.priority, inner.tracker.global_limit().is_some())
        };

        if !defer {
            let attempt = inner.windows.try_consume_all(&subject, config, now, || {
                inner.tracker.try_acquire(&subject, config.concurrent_requests)
            });
            match attempt {
                Ok(()) => {
                    EngineStats::bump(&inner.stats.admitted_direct);
                    debug!(identity = %identity, subject = %subject, "Admitted");
                    return AdmissionResult::Admitted(Permit::new(subject, false, inner.clone()));
                }
                Err(WindowBlock::Exhausted(tier)) => {
                    debug!(identity = %identity, tier = %tier, "Window exhausted");
                }
                Err(WindowBlock::Gate) => {
                    debug!(identity = %identity, "Concurrency cap reached");
                }
            }
        }

        self.enqueue(identity, subject, &resolved, now, options)
    }

    fn enqueue(
        &self,
        identity: &Identity,
        subject: Scope,
        resolved: &ResolvedConfig,
        now: u64,
        options: SubmitOptions,
    ) -> AdmissionResult {
        let inner = &self.inner;
        let config = resolved.config();

        let max_wait = options.max_wait.or_else(|| inner.config.default_max_wait());
        let deadline = max_wait.map(|wait| now.saturating_add(duration_ms(wait)));

        let (tx, rx) = oneshot::channel();
        let entry = QueueEntry::new(identity.clone(), config.priority, now, deadline, tx);

        let enqueued = {
            let mut queue = inner.queue.lock();
            let result = queue.enqueue(entry);
            inner.sync_queue_len(&queue);
            result
        };

        let (id, position) = match enqueued {
            Ok(accepted) => accepted,
            Err(_) => {
                EngineStats::bump(&inner.stats.rejected_queue_full);
                warn!(identity = %identity, max_size = inner.config.max_queue_size, "Queue full, request rejected");
                return AdmissionResult::Rejected(RejectReason::QueueFull);
            }
        };

        EngineStats::bump(&inner.stats.queued);
        let estimated_wait = inner.estimator.estimate_wait(position);
        debug!(
            identity = %identity,
            id,
            position,
            priority = config.priority,
            "Queued request"
        );

        let ticket = Ticket::new(id, position, estimated_wait, rx, inner.clone());

        // A slot may have been freed between the failed attempt and the
        // enqueue; its release drained an empty queue.
        if inner.has_headroom(&subject, config, inner.now_ms()) {
            inner.drain();
        }

        AdmissionResult::Queued(ticket)
    }

    /// Returns one slot for `subject`, for callers that detached their permit.
    ///
    /// Returns `false` when the subject had nothing in flight. That is a
    /// caller bug; it is counted and logged and otherwise ignored.
    pub fn release(&self, subject: &Scope) -> bool {
        self.inner.release_slot(subject)
    }

    /// Effective config for `identity`.
    pub fn resolve(&self, identity: &Identity) -> ResolvedConfig {
        self.inner.store.resolve(identity)
    }

    /// Adds a record. Waiting entries are re-examined afterwards.
    pub fn create_config(
        &self,
        scope: Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        let record = self.inner.store.create(scope, config)?;
        self.inner.drain();
        Ok(record)
    }

    /// Replaces a record. Waiting entries are re-examined afterwards.
    pub fn update_config(
        &self,
        scope: &Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        let record = self.inner.store.update(scope, config)?;
        self.inner.drain();
        Ok(record)
    }

    /// Creates or replaces a record.
    pub fn upsert_config(
        &self,
        scope: Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        let record = self.inner.store.upsert(scope, config)?;
        self.inner.drain();
        Ok(record)
    }

    /// Removes a record.
    pub fn delete_config(&self, scope: &Scope) -> Result<Arc<ConfigRecord>, AdminError> {
        let record = self.inner.store.delete(scope)?;
        self.inner.drain();
        Ok(record)
    }

    /// The record stored for exactly `scope`.
    pub fn get_config(&self, scope: &Scope) -> Option<Arc<ConfigRecord>> {
        self.inner.store.get(scope)
    }

    /// Every stored record, default first.
    pub fn list_configs(&self) -> Vec<ConfigRecord> {
        self.inner.store.list()
    }

    /// Rejects every queued entry with
    /// [`RejectReason::ClearedByAdministrator`] and returns how many there were.
    pub fn clear_queue(&self) -> usize {
        let inner = &self.inner;
        let cleared = {
            let mut queue = inner.queue.lock();
            let taken = queue.take_all();
            inner.sync_queue_len(&queue);
            taken
        };

        let count = cleared.len();
        for entry in cleared {
            // A caller that already went away has nothing to hear
            let _ = entry.resolve(QueueOutcome::Rejected(RejectReason::ClearedByAdministrator));
        }

        EngineStats::add(&inner.stats.cleared, count as u64);
        info!(cleared = count, "Queue cleared by administrator");
        count
    }

    /// Size, bound and smoothed processing time of the queue.
    pub fn queue_telemetry(&self) -> QueueTelemetry {
        QueueTelemetry {
            queue_size: self.inner.queue_len.load(Ordering::Acquire),
            max_size: self.inner.config.max_queue_size,
            process_time_estimate: self.inner.estimator.average_wait().as_secs_f64(),
        }
    }

    /// Entries waiting right now.
    pub fn queue_size(&self) -> usize {
        self.inner.queue_len.load(Ordering::Acquire)
    }

    /// Requests in flight for `subject`.
    pub fn in_flight(&self, subject: &Scope) -> u32 {
        self.inner.tracker.in_flight(subject)
    }

    /// Admissions charged to `subject` in the current window of `tier`.
    pub fn window_count(&self, subject: &Scope, tier: Tier) -> u32 {
        self.inner
            .windows
            .count(subject, tier, self.inner.now_ms())
    }

    /// Snapshot of every counter.
    pub fn metrics(&self) -> EngineMetrics {
        let inner = &self.inner;
        let stats = &inner.stats;
        EngineMetrics {
            total_submitted: EngineStats::read(&stats.submitted),
            admitted_direct: EngineStats::read(&stats.admitted_direct),
            admitted_from_queue: EngineStats::read(&stats.admitted_from_queue),
            admitted_unlimited: EngineStats::read(&stats.admitted_unlimited),
            total_queued: EngineStats::read(&stats.queued),
            rejected_queue_full: EngineStats::read(&stats.rejected_queue_full),
            timed_out: EngineStats::read(&stats.timed_out),
            cleared: EngineStats::read(&stats.cleared),
            cancelled: EngineStats::read(&stats.cancelled),
            double_releases: inner.tracker.double_releases(),
            queue_size: inner.queue_len.load(Ordering::Acquire),
            max_queue_size: inner.config.max_queue_size,
            in_flight: inner.tracker.total_in_flight(),
            tracked_subjects: inner.windows.tracked_subjects(),
            window_rollovers: inner.windows.total_rollovers(),
            evicted_subjects: inner.windows.total_evicted(),
            drain_passes: EngineStats::read(&stats.drains),
            process_time_estimate: inner.estimator.average_wait().as_secs_f64(),
        }
    }
}

impl Default for AdmissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("queue_size", &self.queue_size())
            .field("max_queue_size", &self.inner.config.max_queue_size)
            .field("in_flight", &self.inner.tracker.total_in_flight())
            .field("records", &self.inner.store.len())
            .finish()
    }
}
