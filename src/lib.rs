//! # Rater Admission - Request Admission Control for Rust
//!
//! An admission engine that decides, per request, whether it runs now, waits
//! in a bounded priority queue, or is turned away. Limits are configured per
//! API key, per user, or as a process-wide default, and can be changed at
//! runtime without restarting anything.
//!
//! ## What does it enforce?
//!
//! ```text
//!     Per identity:
//!
//!     requests_per_minute ──┐
//!     requests_per_hour   ──┼──► all three must have headroom
//!     requests_per_day    ──┘
//!     concurrent_requests ─────► in-flight cap
//!     priority            ─────► order in the queue, higher first
//!     is_unlimited        ─────► skip all of the above
//! ```
//!
//! A request that can't run right now is queued rather than failed. Queued
//! requests are admitted as slots are released, windows roll over, or an
//! operator relaxes a limit. Only a full queue, a timeout, or an operator
//! clearing the queue turns a request away.
//!
//! ## Features
//!
//! - 🔒 **Per-identity state** - Sharded maps and per-subject locks, no global lock on the hot path
//! - ⚖️ **All-or-nothing charging** - A request is charged to every tier or to none
//! - 📬 **Priority queue** - Higher priority first, FIFO within a priority, O(log n) cancel
//! - 🔄 **Copy-on-write config** - Admin changes never tear an in-progress decision
//! - 🎫 **Permits and tickets** - Slots release on drop; tickets can be awaited or waited on
//! - 📊 **Real-time Metrics** - Queue telemetry, counters and a health assessment
//!
//! ## Quick Start
//!
//! ```rust
//! use rater_admission::{AdmissionEngine, AdmissionResult, Identity};
//!
//! let engine = AdmissionEngine::new();
//!
//! match engine.submit(&Identity::user("alice")) {
//!     AdmissionResult::Admitted(permit) => {
//!         println!("✅ Request approved - processing...");
//!         // Your request handling code here; the slot is released when
//!         // `permit` is dropped
//!         drop(permit);
//!     }
//!     AdmissionResult::Queued(ticket) => {
//!         println!("⏳ Queued, expected wait {:?}", ticket.estimated_wait());
//!     }
//!     AdmissionResult::Rejected(reason) => {
//!         println!("⛔ Rejected: {}", reason);
//!         // Return 429 Too Many Requests
//!     }
//! }
//! ```
//!
//! ### Administering limits
//!
//! ```rust
//! use rater_admission::{AdmissionEngine, Identity, RateLimitConfig, Scope};
//!
//! let engine = AdmissionEngine::new();
//!
//! // Everyone: 60/min, 1000/hr, 10000/day, 5 at a time
//! engine
//!     .upsert_config(Scope::Default, RateLimitConfig::new(60, 1_000, 10_000).with_concurrency(5))
//!     .unwrap();
//!
//! // A premium key jumps the queue
//! engine
//!     .create_config(Scope::api_key("premium"), RateLimitConfig::default().with_priority(10))
//!     .unwrap();
//!
//! // An internal service is never limited
//! engine
//!     .create_config(Scope::user("batch-service"), RateLimitConfig::unlimited())
//!     .unwrap();
//!
//! let resolved = engine.resolve(&Identity::api_key("premium").with_user("bob"));
//! assert_eq!(resolved.matched(), &Scope::api_key("premium"));
//! assert_eq!(engine.list_configs().len(), 3);
//! ```
//!
//! ### Waiting for a queued request
//!
//! ```rust
//! use rater_admission::{AdmissionEngineBuilder, Identity, QueueOutcome, RateLimitConfig, Scope};
//! use std::time::Duration;
//!
//! let engine = AdmissionEngineBuilder::new()
//!     .max_queue_size(100)
//!     .default_max_wait(Duration::from_secs(30))
//!     .build();
//! engine
//!     .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
//!     .unwrap();
//!
//! let supervisor = engine.start_supervisor().unwrap();
//!
//! let first = engine.submit(&Identity::user("u")).into_permit().unwrap();
//! let ticket = engine.submit(&Identity::user("u")).into_ticket().unwrap();
//!
//! std::thread::spawn(move || drop(first));
//!
//! match ticket.blocking_wait() {
//!     QueueOutcome::Admitted(_permit) => println!("running"),
//!     QueueOutcome::Rejected(reason) => println!("gave up: {}", reason),
//! }
//! supervisor.stop();
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Your Application      │
//!                    └──────────┬──────────────┘
//!                               │
//!                    ┌──────────▼──────────────┐
//!                    │    AdmissionEngine      │
//!                    ├─────────────────────────┤
//!                    │  • submit()             │
//!                    │  • *_config()           │
//!                    │  • clear_queue()        │
//!                    │  • queue_telemetry()    │
//!                    └──────────┬──────────────┘
//!                               │
//!        ┌──────────────┬───────┴───────┬──────────────────┐
//!        │              │               │                  │
//!  ┌─────▼─────┐ ┌──────▼──────┐ ┌──────▼──────┐ ┌─────────▼─────────┐
//!  │ Config    │ │ Window      │ │ Concurrency │ │ Priority Queue    │
//!  │ Store     │ │ Counter     │ │ Tracker     │ │ + Supervisor      │
//!  ├───────────┤ ├─────────────┤ ├─────────────┤ ├───────────────────┤
//!  │ CoW Arcs  │ │ per-subject │ │ atomic CAS  │ │ BTreeMap by       │
//!  │ versioned │ │ mutex       │ │ floored at 0│ │ (prio, arrival)   │
//!  └───────────┘ └─────────────┘ └─────────────┘ └───────────────────┘
//! ```
//!
//! ## Performance Characteristics
//!
//! | Operation | Time Complexity |
//! |-----------|----------------|
//! | submit() admitted | O(1)* |
//! | submit() queued | O(log n + k) |
//! | Ticket::cancel() | O(log n) |
//! | release() + drain | O(n) in queue size |
//! | queue_telemetry() | O(1) |
//!
//! *Amortized constant time with bounded retries under contention; k is the
//! number of entries ahead of the new one.
//!
//! ## Thread Safety
//!
//! `AdmissionEngine` is `Clone` and every clone shares the same state, so it
//! can be handed to as many request handlers as needed. Permits and tickets
//! are `Send`.
//!
//! ## Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber:
//! `debug` for individual decisions, `info` for lifecycle and admin actions,
//! `warn` for full queues, timeouts and double releases.
//!
//! ## Examples
//!
//! See the `demos/` directory for complete programs:
//! - `basic.rs` - Admission, queueing, admin operations and metrics
//! - `priority_queue.rs` - Priority order under a shared cap, unlimited keys, async tickets

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Internal module
mod admission;

// Public re-exports
pub use admission::{
    cpu_relax, current_time_ms, AdminError, AdmissionEngine, AdmissionResult, Clock,
    ConcurrencyTracker, ConfigError, ConfigRecord, ConfigStore, EngineConfig, EngineMetrics,
    EntryId, HealthStatus, Identity, ManualClock, Permit, QueueOutcome, QueueTelemetry,
    RateLimitConfig, RejectReason, ResolvedConfig, Scope, SubmitOptions, SupervisorHandle,
    SystemClock, Ticket, Tier, WindowBlock, WindowCounter, DEFAULT_CONCURRENT_REQUESTS,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_REQUESTS_PER_DAY, DEFAULT_REQUESTS_PER_HOUR,
    DEFAULT_REQUESTS_PER_MINUTE,
};

use std::sync::Arc;
use std::time::Duration;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
///
/// This crate requires at least Rust 1.70.0 due to:
/// - `OnceLock` and `Option::is_some_and`
/// - `let ... else` bindings
/// - Edition 2021 features
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// Import everything you need with a single line:
/// ```rust
/// use rater_admission::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical admission control use cases.
    //!
    //! # Example
    //! ```rust
    //! use rater_admission::prelude::*;
    //!
    //! let engine = AdmissionEngine::new();
    //! let config = RateLimitConfig::default();
    //! let status = HealthStatus::Healthy;
    //! let result = engine.submit(&Identity::anonymous());
    //! assert!(matches!(result, AdmissionResult::Admitted(_)));
    //! ```

    pub use crate::{
        AdmissionEngine, AdmissionEngineBuilder, AdmissionResult, HealthStatus, Identity,
        Permit, QueueOutcome, RateLimitConfig, RejectReason, Scope, SubmitOptions, Ticket,
    };
}

/// Builder for engines with non-default settings.
///
/// # Example
///
/// ```rust
/// use rater_admission::{AdmissionEngineBuilder, ManualClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::new(0));
/// let engine = AdmissionEngineBuilder::new()
///     .max_queue_size(500)
///     .default_max_wait(Duration::from_secs(60))
///     .global_concurrent_limit(64)
///     .clock(clock.clone())
///     .build();
/// assert_eq!(engine.queue_telemetry().max_size, 500);
///
/// // Or use try_build() for error handling
/// let result = AdmissionEngineBuilder::new()
///     .max_queue_size(0)  // Invalid!
///     .try_build();
///
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone)]
pub struct AdmissionEngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl AdmissionEngineBuilder {
    /// Creates a builder with [`EngineConfig::default`] and the system clock.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: None,
        }
    }

    /// Starts from an existing config, e.g. one loaded with serde.
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
        }
    }

    /// Bound on the shared queue (must be > 0).
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    /// Timeout for queued entries that don't set their own.
    pub fn default_max_wait(mut self, wait: Duration) -> Self {
        self.config = self.config.with_default_max_wait(Some(wait));
        self
    }

    /// Let queued entries wait forever unless they set their own timeout.
    pub fn no_default_max_wait(mut self) -> Self {
        self.config.default_max_wait_ms = None;
        self
    }

    /// Supervisor cadence in milliseconds (must be > 0).
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    /// Idle sweep cadence in milliseconds (must be > 0).
    pub fn sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.sweep_interval_ms = ms;
        self
    }

    /// How long a subject stays idle before its state is forgotten.
    pub fn idle_eviction_ms(mut self, ms: u64) -> Self {
        self.config.idle_eviction_ms = ms;
        self
    }

    /// Weight of the newest sample in the wait estimate, in `(0, 1]`.
    pub fn ewma_alpha(mut self, alpha: f64) -> Self {
        self.config.ewma_alpha = alpha;
        self
    }

    /// Cap on in-flight requests summed over every identity.
    pub fn global_concurrent_limit(mut self, limit: u32) -> Self {
        self.config.global_concurrent_limit = Some(limit);
        self
    }

    /// Whether a released slot drains the queue inline.
    ///
    /// When disabled, only the supervisor thread, config changes and
    /// explicit [`AdmissionEngine::drain`] calls admit queued entries.
    pub fn drain_on_release(mut self, enabled: bool) -> Self {
        self.config.drain_on_release = enabled;
        self
    }

    /// Time source; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the engine.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid:
    /// - `max_queue_size` is 0
    /// - `ewma_alpha` is outside `(0, 1]`
    /// - an interval or the global limit is 0
    /// - `idle_eviction_ms` is shorter than a day
    ///
    /// Use `try_build()` if you want to handle errors.
    pub fn build(self) -> AdmissionEngine {
        self.try_build()
            .unwrap_or_else(|e| panic!("invalid engine config: {}", e))
    }

    /// Attempts to build the engine, returning an error if invalid.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn try_build(self) -> Result<AdmissionEngine, ConfigError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(AdmissionEngine::with_clock(self.config, clock))
    }
}

impl Default for AdmissionEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
