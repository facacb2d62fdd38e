//! Coordination store protocol.
//!
//! All shared mutable state in this crate (quota counters and lock leases)
//! lives in a key-value store reached through [`CoordinationStore`]. Every
//! trait method is a single atomic round trip: the limit check and the
//! increment (or the token check and the delete) happen server-side with no
//! intervening operation from another caller, which is what makes the quota
//! ceiling and lock mutual exclusion hold across processes.
//!
//! Backends:
//! - [`memory::MemoryStore`]: mutex-guarded map with lazy TTL expiry, for
//!   tests and single-process deployments.
//! - `redis::RedisStore` (feature `redis-store`): Lua scripts and
//!   `SET NX PX`, for multi-process deployments.

use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

/// Sentinel reply for "nothing was mutated": the limit was already reached
/// (for [`CoordinationStore::bounded_incr`]) or there was nothing to
/// decrement (for [`CoordinationStore::saturating_decr`]).
///
/// Callers must treat only this value as rejection; any non-negative reply
/// is the post-operation count.
pub const REJECTED: i64 = -1;

/// Errors surfaced by store backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("coordination store unavailable: {reason}")]
    Unavailable {
        /// Backend-specific description of the fault.
        reason: String,
    },
    /// The store returned a value this crate never writes.
    #[error("corrupt value under key '{key}'")]
    Corrupt {
        /// The offending key.
        key: String,
    },
}

/// Atomic operations against the shared key-value store.
///
/// Implementations must guarantee that each method executes as one
/// indivisible operation on the store side. Performing the read and the
/// write as separate round trips reintroduces the check-then-act race this
/// crate exists to prevent.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Increment the counter under `key` unless it has reached `limit`.
    ///
    /// If the key is absent it is initialized to zero with the given `ttl`
    /// first. An increment preserves the remaining TTL. Returns the new
    /// count, or [`REJECTED`] (without mutating) when the current value is
    /// at or above `limit`.
    async fn bounded_incr(&self, key: &str, limit: u32, ttl: Duration) -> Result<i64, StoreError>;

    /// Decrement the counter under `key` if it exists and is positive.
    ///
    /// Preserves the remaining TTL. Returns the new count, or [`REJECTED`]
    /// when the key is absent or already zero; in that case the key is
    /// *not* recreated and the value never goes negative.
    async fn saturating_decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Read the counter under `key` without mutating it.
    ///
    /// Advisory only (quota hints); never part of an admit decision.
    async fn read_count(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Set `key` to `token` with expiry `ttl`, only if the key is absent.
    ///
    /// Returns `true` when the caller now holds the key.
    async fn put_if_absent(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete `key` only if its current value equals `token`.
    ///
    /// Returns `true` when the key was deleted; `false` when it was absent
    /// or held by a different token.
    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}

/// Key layout shared by the quota counter and the lock.
///
/// Quota keys embed the period index so a rollover lands on a fresh counter;
/// lock keys are period-independent ("a creation is in flight for this
/// subject").
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space under the given namespace prefix.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        assert!(!namespace.is_empty(), "key namespace must not be empty");
        Self { namespace }
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Counter key for one subject within one quota period.
    pub fn quota_key(&self, subject: &str, period_index: u64) -> String {
        format!("{}:quota:{}:{}", self.namespace, subject, period_index)
    }

    /// Lock key for one subject.
    pub fn lock_key(&self, subject: &str) -> String {
        format!("{}:lock:{}", self.namespace, subject)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("quotagate")
    }
}
