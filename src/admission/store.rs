//! # Rate Limit Config Store
//!
//! Resolves an [`Identity`] to the [`RateLimitConfig`] that governs it and
//! holds the administrative records.
//!
//! ## Resolution
//!
//! ```text
//!     Identity { api_key: k, user: u }
//!          │
//!          ├──► record for ApiKey(k)?  ──yes──► use it
//!          ├──► record for User(u)?    ──yes──► use it
//!          ├──► record for Default?    ──yes──► use it
//!          └──► built-in fallback (20/min, 200/hr, 1000/day, 3 concurrent)
//! ```
//!
//! Resolution never fails, so admission control can't be switched off by a
//! missing record.
//!
//! ## Copy-on-write records
//!
//! Records are stored as `Arc<ConfigRecord>` inside a sharded `DashMap`.
//! A reader clones the `Arc` and works from that snapshot for the whole
//! decision; a writer swaps in a new `Arc` with a bumped version. Writers
//! only lock one shard for the duration of the swap and never block readers
//! of other scopes.

use super::config::{Identity, RateLimitConfig, Scope};
use super::error::AdminError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// A stored record: the scope it applies to, its limits and a version.
///
/// Versions are drawn from one store-wide counter, so a newer write to any
/// scope always carries a larger version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigRecord {
    /// Scope the record applies to.
    pub scope: Scope,
    /// The limits.
    pub config: RateLimitConfig,
    /// Store-wide monotonically increasing version.
    pub version: u64,
}

/// The outcome of resolving an identity: a snapshot of one record.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    record: Arc<ConfigRecord>,
}

impl ResolvedConfig {
    /// The effective limits.
    #[inline]
    pub fn config(&self) -> &RateLimitConfig {
        &self.record.config
    }

    /// Scope of the record that matched; `Default` for the fallback.
    pub fn matched(&self) -> &Scope {
        &self.record.scope
    }

    /// Version of the matched record; 0 for the built-in fallback.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    /// `true` when no record matched and the built-in defaults apply.
    pub fn is_fallback(&self) -> bool {
        self.record.version == 0
    }
}

/// Concurrent store of per-scope rate limit records.
///
/// # Example
///
/// ```rust
/// use rater_admission::{ConfigStore, Identity, RateLimitConfig, Scope};
///
/// let store = ConfigStore::new();
/// store.create(Scope::user("u-1"), RateLimitConfig::new(5, 50, 500)).unwrap();
///
/// let resolved = store.resolve(&Identity::api_key("k-9").with_user("u-1"));
/// assert_eq!(resolved.matched(), &Scope::user("u-1"));
/// assert_eq!(resolved.config().requests_per_minute, 5);
/// ```
pub struct ConfigStore {
    records: DashMap<Scope, Arc<ConfigRecord>, ahash::RandomState>,
    next_version: AtomicU64,
    fallback: Arc<ConfigRecord>,
}

impl ConfigStore {
    /// Creates an empty store; every identity resolves to the built-in defaults.
    pub fn new() -> Self {
        Self {
            records: DashMap::with_hasher(ahash::RandomState::new()),
            next_version: AtomicU64::new(1),
            fallback: Arc::new(ConfigRecord {
                scope: Scope::Default,
                config: RateLimitConfig::default(),
                version: 0,
            }),
        }
    }

    /// Returns the effective config for `identity`.
    ///
    /// Precedence is API key, then user, then the default record, then the
    /// built-in fallback.
    pub fn resolve(&self, identity: &Identity) -> ResolvedConfig {
        for scope in identity.candidate_scopes() {
            if let Some(record) = self.records.get(&scope) {
                return ResolvedConfig {
                    record: record.value().clone(),
                };
            }
        }

        ResolvedConfig {
            record: self.fallback.clone(),
        }
    }

    /// Returns the record stored for exactly `scope`.
    pub fn get(&self, scope: &Scope) -> Option<Arc<ConfigRecord>> {
        self.records.get(scope).map(|r| r.value().clone())
    }

    /// Lists every record, default first, then users, then API keys.
    pub fn list(&self) -> Vec<ConfigRecord> {
        let mut records: Vec<ConfigRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().as_ref().clone())
            .collect();
        records.sort_by(|a, b| a.scope.cmp(&b.scope));
        records
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a record for a scope that has none.
    ///
    /// # Errors
    ///
    /// - [`AdminError::Invalid`] if `config` fails validation
    /// - [`AdminError::AlreadyExists`] if the scope already has a record
    pub fn create(
        &self,
        scope: Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        config.validate()?;

        match self.records.entry(scope) {
            Entry::Occupied(occupied) => Err(AdminError::AlreadyExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let record = Arc::new(ConfigRecord {
                    scope: vacant.key().clone(),
                    config,
                    version: self.bump_version(),
                });
                vacant.insert(record.clone());
                info!(scope = %record.scope, version = record.version, "Created rate limit record");
                Ok(record)
            }
        }
    }

    /// Replaces the record for a scope that has one.
    ///
    /// Decisions already made, and entries already queued, keep the values
    /// they observed; only later resolutions see the new record.
    ///
    /// # Errors
    ///
    /// - [`AdminError::Invalid`] if `config` fails validation
    /// - [`AdminError::NotFound`] if the scope has no record
    pub fn update(
        &self,
        scope: &Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        config.validate()?;

        let mut slot = self
            .records
            .get_mut(scope)
            .ok_or_else(|| AdminError::NotFound(scope.clone()))?;

        let record = Arc::new(ConfigRecord {
            scope: scope.clone(),
            config,
            version: self.bump_version(),
        });
        *slot = record.clone();
        info!(scope = %scope, version = record.version, "Updated rate limit record");
        Ok(record)
    }

    /// Creates or replaces the record for `scope`.
    pub fn upsert(
        &self,
        scope: Scope,
        config: RateLimitConfig,
    ) -> Result<Arc<ConfigRecord>, AdminError> {
        config.validate()?;

        let record = Arc::new(ConfigRecord {
            scope: scope.clone(),
            config,
            version: self.bump_version(),
        });
        self.records.insert(scope, record.clone());
        info!(scope = %record.scope, version = record.version, "Upserted rate limit record");
        Ok(record)
    }

    /// Removes the record for `scope`.
    ///
    /// Deleting the default record is allowed; resolution then falls back to
    /// the built-in defaults.
    ///
    /// # Errors
    ///
    /// [`AdminError::NotFound`] if the scope has no record.
    pub fn delete(&self, scope: &Scope) -> Result<Arc<ConfigRecord>, AdminError> {
        let (_, record) = self
            .records
            .remove(scope)
            .ok_or_else(|| AdminError::NotFound(scope.clone()))?;
        info!(scope = %scope, version = record.version, "Deleted rate limit record");
        Ok(record)
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::AcqRel)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("records", &self.records.len())
            .field("next_version", &self.next_version.load(Ordering::Relaxed))
            .finish()
    }
}
