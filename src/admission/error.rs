//! Errors for configuration validation and administrative operations.
//!
//! Admission decisions are never errors: `submit` always answers with an
//! [`AdmissionResult`](super::AdmissionResult). The types here cover the
//! administrative surface (record CRUD) and builder validation only.

use super::config::Scope;
use thiserror::Error;

/// A configuration value that cannot be used.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A limit that must be positive was zero.
    #[error("{field} must be greater than 0")]
    ZeroLimit {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The queue would never accept an entry.
    #[error("max_queue_size must be greater than 0")]
    ZeroQueueSize,

    /// The smoothing factor for the wait-time average is outside `(0, 1]`.
    #[error("ewma_alpha must be in (0, 1], got {0}")]
    InvalidAlpha(f64),

    /// A periodic interval was zero.
    #[error("{field} must be greater than 0")]
    ZeroInterval {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Idle subjects would be forgotten while their day window is still open.
    #[error("idle_eviction_ms must be at least one day ({min} ms), got {got}")]
    IdleEvictionTooShort {
        /// Configured value.
        got: u64,
        /// Smallest accepted value.
        min: u64,
    },
}

/// Failure of a create/update/delete on the config store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdminError {
    /// `create` was called for a scope that already has a record.
    #[error("a rate limit record already exists for {0}")]
    AlreadyExists(Scope),

    /// `update` or `delete` was called for a scope without a record.
    #[error("no rate limit record for {0}")]
    NotFound(Scope),

    /// The submitted record failed validation.
    #[error("invalid rate limit config: {0}")]
    Invalid(#[from] ConfigError),
}
