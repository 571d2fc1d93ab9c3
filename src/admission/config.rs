//! # Admission Configuration
//!
//! Configuration records and identity types for the admission engine.
//!
//! ## Key Concepts
//!
//! ### Identities and scopes
//!
//! ```text
//!     Identity (who is asking)          Scope (what a record is keyed by)
//!     ┌──────────────────────────┐      ┌─────────────────────────────┐
//!     │ api_key_id: Some("k-7")  │ ───► │ ApiKey("k-7")   most specific│
//!     │ user_id:    Some("u-3")  │ ───► │ User("u-3")                  │
//!     │                          │ ───► │ Default         least        │
//!     └──────────────────────────┘      └─────────────────────────────┘
//! ```
//!
//! A request's [`Identity`] is resolved against config records by walking its
//! candidate scopes from most to least specific. The same identity's
//! *subject* (its most specific present scope) keys the window and
//! concurrency state.
//!
//! ### Tiers
//!
//! ```text
//!     Minute ──►     60_000 ms
//!     Hour   ──►  3_600_000 ms
//!     Day    ──► 86_400_000 ms
//! ```
//!
//! A request must fit every tier at once.

use super::error::ConfigError;
use super::utils::duration_ms;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Requests per minute when no record applies.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 20;

/// Requests per hour when no record applies.
pub const DEFAULT_REQUESTS_PER_HOUR: u32 = 200;

/// Requests per day when no record applies.
pub const DEFAULT_REQUESTS_PER_DAY: u32 = 1000;

/// Concurrent in-flight requests when no record applies.
pub const DEFAULT_CONCURRENT_REQUESTS: u32 = 3;

/// Default bound on the shared waiting queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Key of a configuration record, and of per-subject counters.
///
/// Ordering is `Default < User < ApiKey`, so a sorted listing shows the
/// default record first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Scope {
    /// The process-wide default record, and the bucket shared by anonymous callers.
    Default,
    /// A specific user id.
    User(String),
    /// A specific API key id.
    ApiKey(String),
}

impl Scope {
    /// Shorthand for `Scope::User(id.into())`.
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    /// Shorthand for `Scope::ApiKey(id.into())`.
    pub fn api_key(id: impl Into<String>) -> Self {
        Self::ApiKey(id.into())
    }

    /// Returns `true` for [`Scope::Default`].
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::User(id) => write!(f, "user:{}", id),
            Self::ApiKey(id) => write!(f, "api_key:{}", id),
        }
    }
}

/// The caller on whose behalf a request is submitted.
///
/// # Example
///
/// ```rust
/// use rater_admission::{Identity, Scope};
///
/// let id = Identity::api_key("k-1").with_user("u-1");
/// assert_eq!(id.subject(), Scope::api_key("k-1"));
///
/// let anon = Identity::anonymous();
/// assert_eq!(anon.subject(), Scope::Default);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    api_key_id: Option<String>,
    user_id: Option<String>,
}

impl Identity {
    /// A caller with neither a user nor an API key.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller authenticated as a user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            api_key_id: None,
            user_id: Some(user_id.into()),
        }
    }

    /// A caller authenticated with an API key.
    pub fn api_key(api_key_id: impl Into<String>) -> Self {
        Self {
            api_key_id: Some(api_key_id.into()),
            user_id: None,
        }
    }

    /// Attaches the user owning this caller's API key.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The API key id, if any.
    pub fn api_key_id(&self) -> Option<&str> {
        self.api_key_id.as_deref()
    }

    /// The user id, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The most specific scope present; keys this caller's counters.
    pub fn subject(&self) -> Scope {
        if let Some(key) = &self.api_key_id {
            Scope::ApiKey(key.clone())
        } else if let Some(user) = &self.user_id {
            Scope::User(user.clone())
        } else {
            Scope::Default
        }
    }

    /// Scopes to try when resolving a config, most specific first.
    pub(crate) fn candidate_scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.api_key_id
            .iter()
            .map(|k| Scope::ApiKey(k.clone()))
            .chain(self.user_id.iter().map(|u| Scope::User(u.clone())))
            .chain(std::iter::once(Scope::Default))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.api_key_id, &self.user_id) {
            (Some(k), Some(u)) => write!(f, "api_key:{} (user:{})", k, u),
            (Some(k), None) => write!(f, "api_key:{}", k),
            (None, Some(u)) => write!(f, "user:{}", u),
            (None, None) => write!(f, "anonymous"),
        }
    }
}

/// One of the three independently enforced time windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Rolling minute.
    Minute,
    /// Rolling hour.
    Hour,
    /// Rolling day.
    Day,
}

impl Tier {
    /// All tiers in the order they are probed.
    pub const ALL: [Tier; 3] = [Tier::Minute, Tier::Hour, Tier::Day];

    /// Window length in milliseconds.
    #[inline]
    pub const fn window_ms(self) -> u64 {
        match self {
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// Limits applied to one scope.
///
/// ```text
///     ┌────────────────────────────────────┐
///     │ requests_per_minute: 20            │
///     │ requests_per_hour:   200           │ ← every tier must have headroom
///     │ requests_per_day:    1000          │
///     │ concurrent_requests: 3             │ ← in-flight cap
///     │ priority:            0             │ ← queue order, higher first
///     │ is_unlimited:        false         │ ← bypasses everything above
///     └────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```rust
/// use rater_admission::RateLimitConfig;
///
/// let cfg = RateLimitConfig::new(60, 1_000, 10_000)
///     .with_concurrency(5)
///     .with_priority(10);
/// assert!(cfg.validate().is_ok());
///
/// let admin = RateLimitConfig::unlimited();
/// assert!(admin.is_unlimited);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per rolling minute.
    pub requests_per_minute: u32,

    /// Admissions allowed per rolling hour.
    pub requests_per_hour: u32,

    /// Admissions allowed per rolling day.
    pub requests_per_day: u32,

    /// Requests allowed in flight at once.
    pub concurrent_requests: u32,

    /// Queue priority; higher is served first.
    pub priority: i32,

    /// Skip every limit and admit immediately.
    pub is_unlimited: bool,
}

impl Default for RateLimitConfig {
    /// 20/min, 200/hr, 1000/day, 3 concurrent, priority 0, limited.
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            requests_per_hour: DEFAULT_REQUESTS_PER_HOUR,
            requests_per_day: DEFAULT_REQUESTS_PER_DAY,
            concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
            priority: 0,
            is_unlimited: false,
        }
    }
}

impl RateLimitConfig {
    /// Creates a config with the given tier limits and default concurrency/priority.
    pub fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            requests_per_day: per_day,
            ..Default::default()
        }
    }

    /// A config that admits everything immediately.
    pub fn unlimited() -> Self {
        Self {
            is_unlimited: true,
            ..Default::default()
        }
    }

    /// Sets the in-flight cap.
    pub fn with_concurrency(mut self, concurrent: u32) -> Self {
        self.concurrent_requests = concurrent;
        self
    }

    /// Sets the queue priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the unlimited flag.
    pub fn with_unlimited(mut self, unlimited: bool) -> Self {
        self.is_unlimited = unlimited;
        self
    }

    /// Replaces all three tier limits.
    pub fn with_limits(mut self, per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        self.requests_per_minute = per_minute;
        self.requests_per_hour = per_hour;
        self.requests_per_day = per_day;
        self
    }

    /// Limit for one tier.
    #[inline]
    pub fn limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Minute => self.requests_per_minute,
            Tier::Hour => self.requests_per_hour,
            Tier::Day => self.requests_per_day,
        }
    }

    /// Checks that every limit is positive.
    ///
    /// Unlimited records are held to the same rule so that clearing the flag
    /// later never activates a zero limit.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rater_admission::RateLimitConfig;
    ///
    /// let bad = RateLimitConfig::new(0, 10, 10);
    /// assert!(bad.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("requests_per_minute", self.requests_per_minute),
            ("requests_per_hour", self.requests_per_hour),
            ("requests_per_day", self.requests_per_day),
            ("concurrent_requests", self.concurrent_requests),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }
        Ok(())
    }
}

/// Engine-wide settings.
///
/// ```text
///     ┌──────────────────────────────────────────┐
///     │ max_queue_size:          1000            │ ← shared by all identities
///     │ default_max_wait_ms:     Some(300_000)   │ ← per-entry timeout
///     │ tick_interval_ms:        100             │ ← supervisor cadence
///     │ sweep_interval_ms:       60_000          │ ← idle subject sweep cadence
///     │ idle_eviction_ms:        86_460_000      │ ← idle threshold
///     │ ewma_alpha:              0.2             │ ← wait estimate smoothing
///     │ global_concurrent_limit: None            │ ← optional shared cap
///     │ drain_on_release:        true            │
///     └──────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of waiting entries across all identities.
    pub max_queue_size: usize,

    /// Timeout for queued entries that do not specify their own.
    pub default_max_wait_ms: Option<u64>,

    /// How often the supervisor thread drains the queue and expires entries.
    pub tick_interval_ms: u64,

    /// How often the supervisor evicts idle subjects.
    pub sweep_interval_ms: u64,

    /// A subject idle for this long with nothing in flight is forgotten.
    pub idle_eviction_ms: u64,

    /// Weight of the newest sample in the service-time average.
    pub ewma_alpha: f64,

    /// Optional cap on in-flight requests summed over every identity.
    pub global_concurrent_limit: Option<u32>,

    /// Drain the queue inline whenever a slot is released.
    pub drain_on_release: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            default_max_wait_ms: Some(300_000),
            tick_interval_ms: 100,
            sweep_interval_ms: 60_000,
            // A day plus a minute: every window has rolled by then
            idle_eviction_ms: Tier::Day.window_ms() + Tier::Minute.window_ms(),
            ewma_alpha: 0.2,
            global_concurrent_limit: None,
            drain_on_release: true,
        }
    }
}

impl EngineConfig {
    /// Sets the queue bound.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets (or clears) the default per-entry timeout.
    pub fn with_default_max_wait(mut self, wait: Option<Duration>) -> Self {
        self.default_max_wait_ms = wait.map(duration_ms);
        self
    }

    /// Sets the optional global in-flight cap.
    pub fn with_global_concurrent_limit(mut self, limit: Option<u32>) -> Self {
        self.global_concurrent_limit = limit;
        self
    }

    /// Default timeout as a `Duration`.
    pub fn default_max_wait(&self) -> Option<Duration> {
        self.default_max_wait_ms.map(Duration::from_millis)
    }

    /// Checks the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::InvalidAlpha(self.ewma_alpha));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "tick_interval_ms",
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "sweep_interval_ms",
            });
        }
        if self.global_concurrent_limit == Some(0) {
            return Err(ConfigError::ZeroLimit {
                field: "global_concurrent_limit",
            });
        }
        let min = Tier::Day.window_ms();
        if self.idle_eviction_ms < min {
            return Err(ConfigError::IdleEvictionTooShort {
                got: self.idle_eviction_ms,
                min,
            });
        }
        Ok(())
    }
}
