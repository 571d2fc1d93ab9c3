//! # Queue Supervisor
//!
//! Moves waiting entries into execution as capacity frees up, expires
//! entries that waited too long, and keeps the wait-time estimate.
//!
//! ## Drain pass
//!
//! ```text
//!     lock queue
//!     for entry in service order:
//!         expired?             ──► remove, Rejected(Timeout)
//!         subject blocked?     ──► skip
//!         re-resolve config
//!         unlimited, or windows + slot available?
//!             yes ──► remove, Admitted(Permit), record wait sample
//!             no  ──► mark subject blocked, try the next entry
//!     unlock
//!     drop outcomes nobody was waiting for
//! ```
//!
//! One exhausted subject never holds up the subjects behind it, while a
//! subject's own entries are served strictly in order.
//!
//! ## Triggers
//!
//! ```text
//!     slot released ──┐
//!     config changed ─┼──► drain()
//!     supervisor tick ┘        │
//!                              ├─ another drain running? ─► ask it to go again
//!                              └─ run passes until no one asked
//! ```
//!
//! Only one drain runs at a time, which also keeps two drains from picking
//! the same entry.

use super::config::Scope;
use super::core::{AdmissionEngine, EngineInner, Permit, QueueOutcome, RejectReason};
use super::metrics::EngineStats;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Smoothed queue wait times.
///
/// Two averages are kept. The wait average is the raw time from enqueue to
/// admission and feeds `process_time_estimate`. The per-slot average divides
/// each wait by the number of positions the entry had to move through and
/// feeds the estimate handed to new tickets.
#[derive(Debug)]
pub(crate) struct ServiceTimeEstimator {
    alpha: f64,
    // f64 bits; NaN until the first sample
    wait_ms: AtomicU64,
    per_slot_ms: AtomicU64,
    samples: AtomicU64,
}

impl ServiceTimeEstimator {
    pub(crate) fn new(alpha: f64) -> Self {
        Self {
            alpha,
            wait_ms: AtomicU64::new(f64::NAN.to_bits()),
            per_slot_ms: AtomicU64::new(f64::NAN.to_bits()),
            samples: AtomicU64::new(0),
        }
    }

    fn blend(&self, cell: &AtomicU64, sample: f64) {
        let alpha = self.alpha;
        let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let current = f64::from_bits(bits);
            let next = if current.is_nan() {
                sample
            } else {
                alpha * sample + (1.0 - alpha) * current
            };
            Some(next.to_bits())
        });
    }

    /// Records one entry admitted after `waited_ms` with `ahead` entries
    /// in front of it at enqueue time.
    pub(crate) fn record(&self, waited_ms: u64, ahead: usize) {
        let waited = waited_ms as f64;
        self.blend(&self.wait_ms, waited);
        self.blend(&self.per_slot_ms, waited / (ahead as f64 + 1.0));
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn read(cell: &AtomicU64) -> f64 {
        let value = f64::from_bits(cell.load(Ordering::Acquire));
        if value.is_nan() {
            0.0
        } else {
            value
        }
    }

    /// Smoothed enqueue-to-admission time.
    pub(crate) fn average_wait(&self) -> Duration {
        Duration::from_secs_f64(Self::read(&self.wait_ms) / 1000.0)
    }

    /// Expected wait for an entry with `position` entries ahead.
    pub(crate) fn estimate_wait(&self, position: usize) -> Duration {
        let per_slot = Self::read(&self.per_slot_ms);
        Duration::from_secs_f64(per_slot * (position as f64 + 1.0) / 1000.0)
    }

    pub(crate) fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// RAII guard for the drain flag.
///
/// Ensures the flag is reset even if a pass panics.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl EngineInner {
    /// Admits whatever can be admitted now. Returns the number admitted.
    ///
    /// If another drain is running it is asked to make one more pass and
    /// this call returns immediately.
    pub(crate) fn drain(self: &Arc<Self>) -> usize {
        let mut admitted = 0;
        loop {
            let Some(guard) = DrainGuard::try_acquire(&self.draining) else {
                self.drain_requested.store(true, Ordering::SeqCst);
                // The holder may have finished between the failed acquire
                // and the request; if so, run the pass here.
                if self.draining.load(Ordering::SeqCst) {
                    return admitted;
                }
                continue;
            };

            self.drain_requested.store(false, Ordering::SeqCst);
            admitted += self.drain_pass();
            drop(guard);

            if !self.drain_requested.load(Ordering::SeqCst) {
                return admitted;
            }
        }
    }

    fn drain_pass(self: &Arc<Self>) -> usize {
        let now = self.now_ms();
        let mut admitted = 0usize;
        let mut expired = 0usize;
        let mut undelivered: Vec<QueueOutcome> = Vec::new();

        {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return 0;
            }
            EngineStats::bump(&self.stats.drains);

            let mut blocked: HashSet<Scope, ahash::RandomState> =
                HashSet::with_hasher(ahash::RandomState::new());

            for id in queue.ids() {
                let Some(entry) = queue.get(id) else {
                    continue;
                };

                if entry.is_expired(now) {
                    if let Some(entry) = queue.remove(id) {
                        expired += 1;
                        warn!(
                            id,
                            subject = %entry.subject,
                            waited_ms = now.saturating_sub(entry.enqueued_at_ms),
                            "Queued request timed out"
                        );
                        if let Err(outcome) = entry.resolve(QueueOutcome::Rejected(RejectReason::Timeout)) {
                            undelivered.push(outcome);
                        }
                    }
                    continue;
                }

                if blocked.contains(&entry.subject) {
                    continue;
                }

                let resolved = self.store.resolve(&entry.identity);
                let config = resolved.config();
                let bypass = config.is_unlimited;

                let ready = bypass
                    || (!self.tracker.is_globally_saturated()
                        && self
                            .windows
                            .try_consume_all(&entry.subject, config, now, || {
                                self.tracker
                                    .try_acquire(&entry.subject, config.concurrent_requests)
                            })
                            .is_ok());

                if !ready {
                    blocked.insert(entry.subject.clone());
                    continue;
                }

                let Some(entry) = queue.remove(id) else {
                    continue;
                };
                let waited_ms = now.saturating_sub(entry.enqueued_at_ms);
                self.estimator.record(waited_ms, entry.ahead_at_enqueue);
                admitted += 1;
                debug!(
                    id,
                    subject = %entry.subject,
                    waited_ms,
                    unlimited = bypass,
                    "Admitted queued request"
                );

                let permit = Permit::new(entry.subject.clone(), bypass, self.clone());
                if let Err(outcome) = entry.resolve(QueueOutcome::Admitted(permit)) {
                    undelivered.push(outcome);
                }
            }

            self.sync_queue_len(&queue);
        }

        EngineStats::add(&self.stats.admitted_from_queue, admitted as u64);
        EngineStats::add(&self.stats.timed_out, expired as u64);
        if !undelivered.is_empty() {
            debug!(count = undelivered.len(), "Callers gone before their outcome arrived");
        }
        // Dropping an undelivered permit releases its slot, which may drain
        // again; the queue lock is no longer held here.
        drop(undelivered);

        admitted
    }

    /// Forgets subjects idle longer than the configured threshold.
    pub(crate) fn sweep_idle(&self) -> usize {
        let waiting: HashSet<Scope, ahash::RandomState> = {
            let queue = self.queue.lock();
            let mut set = HashSet::with_hasher(ahash::RandomState::new());
            set.extend(queue.iter().map(|entry| entry.subject.clone()));
            set
        };

        let now = self.now_ms();
        let windows = self
            .windows
            .sweep(now, self.config.idle_eviction_ms, |subject| {
                waiting.contains(subject) || self.tracker.in_flight(subject) > 0
            });
        let counters = self.tracker.sweep();

        if windows > 0 || counters > 0 {
            debug!(windows, counters, "Idle sweep finished");
        }
        windows
    }
}

impl AdmissionEngine {
    /// Runs a drain now and returns how many entries were admitted.
    ///
    /// Entries past their max wait are rejected along the way. Releases and
    /// config changes already drain; this is for callers that advance time
    /// themselves or run without a supervisor thread.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Forgets window and concurrency state of subjects idle for longer than
    /// `idle_eviction_ms`. Returns the number of subjects whose windows were
    /// dropped.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Number of admissions that fed the wait-time estimate.
    pub fn wait_samples(&self) -> u64 {
        self.inner.estimator.samples()
    }

    /// Starts the supervisor thread.
    ///
    /// Every `tick_interval_ms` it drains the queue, which also expires
    /// timed-out entries; every `sweep_interval_ms` it sweeps idle
    /// subjects. The thread stops when the handle is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rater_admission::AdmissionEngine;
    ///
    /// let engine = AdmissionEngine::new();
    /// let supervisor = engine.start_supervisor().unwrap();
    /// // ... serve requests ...
    /// supervisor.stop();
    /// ```
    pub fn start_supervisor(&self) -> io::Result<SupervisorHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let engine = self.clone();
        let tick = Duration::from_millis(self.inner.config.tick_interval_ms);
        let sweep_every = self.inner.config.sweep_interval_ms;

        let handle = thread::Builder::new()
            .name("admission-supervisor".to_string())
            .spawn(move || {
                info!(
                    "Started queue supervisor (tick: {}ms, sweep: {}ms)",
                    tick.as_millis(),
                    sweep_every
                );

                let mut last_sweep = engine.inner.now_ms();
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            info!("Queue supervisor stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            engine.drain();

                            let now = engine.inner.now_ms();
                            if now.saturating_sub(last_sweep) >= sweep_every {
                                engine.sweep_idle();
                                last_sweep = now;
                            }

                            let telemetry = engine.queue_telemetry();
                            if telemetry.utilization() >= 0.9 {
                                warn!(
                                    "Queue nearly full: {}/{} entries waiting",
                                    telemetry.queue_size, telemetry.max_size
                                );
                            }
                        }
                    }
                }
            })?;

        Ok(SupervisorHandle {
            handle: Some(handle),
            stop_tx,
        })
    }
}

/// Handle to a running supervisor thread.
///
/// Dropping the handle signals the thread to stop without waiting for it.
#[derive(Debug)]
pub struct SupervisorHandle {
    handle: Option<thread::JoinHandle<()>>,
    stop_tx: mpsc::Sender<()>,
}

impl SupervisorHandle {
    /// Signals the thread and waits for it to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Queue supervisor panicked");
            }
        }
    }

    /// `true` while the thread is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::config::{EngineConfig, Identity, RateLimitConfig};
    use crate::admission::queue::QueueEntry;
    use crate::admission::utils::ManualClock;
    use tokio::sync::oneshot;

    const MINUTE: Duration = Duration::from_secs(60);

    fn engine_with(config: EngineConfig) -> (AdmissionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5_000_000));
        (AdmissionEngine::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_estimator_seeds_then_smooths() {
        let est = ServiceTimeEstimator::new(0.5);
        assert_eq!(est.average_wait(), Duration::ZERO);
        assert_eq!(est.estimate_wait(3), Duration::ZERO);

        est.record(1_000, 0);
        assert_eq!(est.average_wait(), Duration::from_secs(1));

        est.record(3_000, 2);
        // 0.5 * 3000 + 0.5 * 1000
        assert_eq!(est.average_wait(), Duration::from_secs(2));
        // per slot: 0.5 * 1000 + 0.5 * 1000 = 1000ms, position 1 waits 2 slots
        assert_eq!(est.estimate_wait(1), Duration::from_secs(2));
        assert_eq!(est.samples(), 2);
    }

    #[test]
    fn test_drain_skips_blocked_subject() {
        let (engine, clock) = engine_with(EngineConfig::default());
        engine
            .create_config(Scope::user("slow"), RateLimitConfig::new(1, 100, 100).with_priority(10))
            .unwrap();
        engine
            .create_config(Scope::user("fast"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();

        let slow = Identity::user("slow");
        let fast = Identity::user("fast");

        let _s = engine.submit(&slow).into_permit().unwrap();
        let f = engine.submit(&fast).into_permit().unwrap();
        let mut slow_ticket = engine.submit(&slow).into_ticket().unwrap();
        let mut fast_ticket = engine.submit(&fast).into_ticket().unwrap();

        // The slow subject heads the queue but is out of minute budget
        drop(f);
        assert!(fast_ticket.try_outcome().unwrap().is_admitted());
        assert!(slow_ticket.try_outcome().is_none());

        clock.advance(MINUTE);
        assert_eq!(engine.drain(), 1);
        assert!(slow_ticket.try_outcome().unwrap().is_admitted());
    }

    #[test]
    fn test_drain_passes_counted_in_metrics() {
        let config = EngineConfig {
            drain_on_release: false,
            ..Default::default()
        };
        let (engine, _clock) = engine_with(config);
        engine
            .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::user("u");

        // Nothing waiting, nothing counted
        assert_eq!(engine.drain(), 0);
        assert_eq!(engine.metrics().drain_passes, 0);

        let first = engine.submit(&id).into_permit().unwrap();
        let mut ticket = engine.submit(&id).into_ticket().unwrap();
        drop(first);
        assert_eq!(engine.metrics().drain_passes, 0);

        assert_eq!(engine.drain(), 1);
        assert!(ticket.try_outcome().unwrap().is_admitted());
        let metrics = engine.metrics();
        assert_eq!(metrics.drain_passes, 1);
        assert!(metrics.summary().contains("Drain Passes: 1"));
    }

    #[test]
    fn test_drain_expires_timed_out_entries() {
        let config = EngineConfig::default().with_default_max_wait(Some(Duration::from_secs(10)));
        let (engine, clock) = engine_with(config);
        engine
            .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::user("u");

        let _permit = engine.submit(&id).into_permit().unwrap();
        let mut ticket = engine.submit(&id).into_ticket().unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(engine.drain(), 0);
        assert!(ticket.try_outcome().is_none());

        clock.advance(Duration::from_secs(1));
        engine.drain();
        assert_eq!(
            ticket.try_outcome().unwrap().reject_reason(),
            Some(RejectReason::Timeout)
        );
        assert_eq!(engine.metrics().timed_out, 1);
        assert_eq!(engine.queue_size(), 0);
    }

    #[test]
    fn test_config_change_admits_waiting_entries() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine
            .create_config(Scope::user("u"), RateLimitConfig::new(1, 10, 10))
            .unwrap();
        let id = Identity::user("u");

        let _first = engine.submit(&id).into_permit().unwrap();
        let mut ticket = engine.submit(&id).into_ticket().unwrap();
        assert!(ticket.try_outcome().is_none());

        engine
            .update_config(&Scope::user("u"), RateLimitConfig::new(5, 10, 10))
            .unwrap();
        assert!(ticket.try_outcome().unwrap().is_admitted());
    }

    #[test]
    fn test_became_unlimited_while_waiting() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine
            .create_config(Scope::api_key("k"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::api_key("k");

        let _first = engine.submit(&id).into_permit().unwrap();
        let mut ticket = engine.submit(&id).into_ticket().unwrap();

        engine
            .update_config(&Scope::api_key("k"), RateLimitConfig::unlimited())
            .unwrap();
        let permit = ticket.try_outcome().unwrap().into_permit().unwrap();
        assert!(permit.is_unlimited());
        assert_eq!(engine.in_flight(&Scope::api_key("k")), 1);
    }

    #[test]
    fn test_wait_samples_feed_telemetry() {
        let (engine, clock) = engine_with(EngineConfig::default());
        engine
            .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::user("u");

        let first = engine.submit(&id).into_permit().unwrap();
        let mut ticket = engine.submit(&id).into_ticket().unwrap();

        clock.advance(Duration::from_secs(4));
        drop(first);
        assert!(ticket.try_outcome().unwrap().is_admitted());

        let telemetry = engine.queue_telemetry();
        assert_eq!(telemetry.queue_size, 0);
        assert_eq!(telemetry.max_size, 1000);
        assert!((telemetry.process_time_estimate - 4.0).abs() < 1e-9);
        assert_eq!(engine.wait_samples(), 1);
    }

    #[test]
    fn test_sweep_idle_keeps_busy_subjects() {
        let (engine, clock) = engine_with(EngineConfig::default());
        let busy = engine.submit(&Identity::user("busy")).into_permit().unwrap();
        engine.submit(&Identity::user("idle")).into_permit().unwrap().release();

        clock.advance(Duration::from_millis(engine.config().idle_eviction_ms));
        assert_eq!(engine.sweep_idle(), 1);
        assert_eq!(engine.metrics().tracked_subjects, 1);
        assert_eq!(engine.metrics().evicted_subjects, 1);
        drop(busy);
    }

    #[test]
    fn test_reentrant_drain_from_undelivered_permit() {
        let (engine, _) = engine_with(EngineConfig::default());
        engine
            .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::user("u");

        let first = engine.submit(&id).into_permit().unwrap();

        // An entry whose caller vanished without cancelling: its permit is
        // undeliverable and the slot must flow on to the next entry
        {
            let (tx, rx) = oneshot::channel();
            drop(rx);
            let entry = QueueEntry::new(id.clone(), 0, engine.inner.now_ms(), None, tx);
            let mut queue = engine.inner.queue.lock();
            queue.enqueue(entry).unwrap();
            engine.inner.sync_queue_len(&queue);
        }
        let mut next = engine.submit(&id).into_ticket().unwrap();
        drop(first);

        assert_eq!(engine.queue_size(), 0);
        assert!(next.try_outcome().unwrap().is_admitted());
    }

    #[test]
    fn test_supervisor_thread_drains_and_stops() {
        let config = EngineConfig {
            tick_interval_ms: 5,
            drain_on_release: false,
            ..Default::default()
        };
        let engine = AdmissionEngine::try_with_config(config).unwrap();
        engine
            .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
            .unwrap();
        let id = Identity::user("u");

        let first = engine.submit(&id).into_permit().unwrap();
        let ticket = engine.submit(&id).into_ticket().unwrap();
        drop(first);
        assert_eq!(engine.queue_size(), 1);

        let supervisor = engine.start_supervisor().unwrap();
        assert!(supervisor.is_running());
        assert!(ticket.blocking_wait().is_admitted());
        supervisor.stop();
    }
}
