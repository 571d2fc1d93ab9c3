//! # Admission Module
//!
//! Internal implementation of the admission engine, one file per component.
//!
//! ## Module Structure
//!
//! ```text
//!     admission/
//!     ├── mod.rs          (You are here - Module organization)
//!     ├── config.rs       (Records, identities, tiers, engine settings)
//!     ├── error.rs        (Admin and validation errors)
//!     ├── store.rs        (Config store: resolution and CRUD)
//!     ├── window.rs       (Minute/hour/day window counters)
//!     ├── concurrency.rs  (In-flight counters)
//!     ├── queue.rs        (Priority queue and tickets)
//!     ├── core.rs         (Admission controller)
//!     ├── supervisor.rs   (Drain loop, wait estimate, background thread)
//!     ├── metrics.rs      (Counters, telemetry, health)
//!     └── utils.rs        (Clocks and spin helpers)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     submit(identity)
//!          │
//!          ▼
//!     ┌─────────┐      ┌─────────┐
//!     │  Core   │ ───► │  Store  │ ◄── admin CRUD
//!     └────┬────┘      └─────────┘
//!          │
//!          ├──► Window ──► Concurrency ──► Admitted
//!          │
//!          ▼
//!     ┌─────────┐      ┌────────────┐
//!     │  Queue  │ ◄─── │ Supervisor │ ◄── release / config change / tick
//!     └─────────┘      └────────────┘
//! ```

mod concurrency;
mod config;
mod core;
mod error;
mod metrics;
mod queue;
mod store;
mod supervisor;
mod utils;
mod window;

/// Records, identities and engine settings
pub use config::{
    EngineConfig, Identity, RateLimitConfig, Scope, Tier, DEFAULT_CONCURRENT_REQUESTS,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_REQUESTS_PER_DAY, DEFAULT_REQUESTS_PER_HOUR,
    DEFAULT_REQUESTS_PER_MINUTE,
};

/// Errors for the administrative surface
pub use error::{AdminError, ConfigError};

/// Config resolution and storage
pub use store::{ConfigRecord, ConfigStore, ResolvedConfig};

/// Building blocks the engine is made of
pub use concurrency::ConcurrencyTracker;
pub use window::{WindowBlock, WindowCounter};

/// The engine and its outcomes
pub use self::core::{
    AdmissionEngine, AdmissionResult, Permit, QueueOutcome, RejectReason, SubmitOptions,
};
pub use queue::{EntryId, Ticket};
pub use supervisor::SupervisorHandle;

/// Metrics and health monitoring
pub use metrics::{EngineMetrics, HealthStatus, QueueTelemetry};

/// Time sources and CPU helpers
pub use utils::{cpu_relax, current_time_ms, Clock, ManualClock, SystemClock};
