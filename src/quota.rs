//! Atomic per-subject quota accounting with compensating refunds.
//!
//! The counter lives in the coordination store under a key that embeds the
//! current period index, with a TTL equal to the remainder of the period,
//! so rollover is just the old counter expiring and the next consume landing
//! on a fresh key. The check and the increment execute as one store-side
//! operation; this module never reads-then-writes the counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::store::{CoordinationStore, KeySpace, StoreError, REJECTED};

/// Immutable quota configuration: how many grants per period.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    limit: u32,
    period: Duration,
}

impl QuotaPolicy {
    /// Create a policy. Panics if `limit` is zero or `period` is shorter
    /// than one second.
    pub fn new(limit: u32, period: Duration) -> Self {
        assert!(limit >= 1, "quota limit must be at least 1");
        assert!(period >= Duration::from_secs(1), "quota period must be at least one second");
        Self { limit, period }
    }

    /// `limit` grants per calendar day (UTC).
    pub fn daily(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(86_400))
    }

    /// The per-period grant limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// The reset window.
    pub fn period(&self) -> Duration {
        self.period
    }

    fn period_millis(&self) -> u64 {
        u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX)
    }

    /// Index of the period containing now. Part of the counter key, so a
    /// rollover lands on a fresh counter.
    pub fn period_index(&self, clock: &dyn Clock) -> u64 {
        clock.now_millis() / self.period_millis()
    }

    /// Time left until the current period rolls over. Doubles as the counter
    /// TTL so stale counters clean themselves up at the boundary.
    pub fn until_rollover(&self, clock: &dyn Clock) -> Duration {
        let period_ms = self.period_millis();
        let into_period = clock.now_millis() % period_ms;
        Duration::from_millis(period_ms - into_period)
    }
}

/// Result of a quota consumption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// A grant was consumed.
    Granted {
        /// Grants consumed so far this period, including this one.
        used: u32,
        /// Grants left this period. Useful for quota-remaining headers.
        remaining: u32,
    },
    /// The period's quota is spent; nothing was consumed.
    Exhausted {
        /// The configured limit.
        limit: u32,
        /// Time until the counter resets.
        resets_in: Duration,
    },
}

impl QuotaDecision {
    /// Helper to check if a grant was consumed.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Result of a compensating refund.
///
/// `Noop` is not an error: the period may have legitimately rolled over
/// between the consume and the refund, in which case the counter is gone and
/// must not be recreated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refund {
    /// One grant was handed back.
    Applied {
        /// Grants still counted as used after the refund.
        remaining_used: u32,
    },
    /// There was nothing to refund (counter expired or already zero).
    Noop,
}

/// Per-subject quota counter over a coordination store.
///
/// Every decision is made by calling into the store; no counter state is
/// cached across calls.
pub struct QuotaCounter<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    keys: KeySpace,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: CoordinationStore + ?Sized> QuotaCounter<S> {
    /// Create a counter over `store`.
    pub fn new(store: Arc<S>, keys: KeySpace, policy: QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, policy, clock }
    }

    /// The policy this counter enforces.
    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    fn current_key(&self, subject: &str) -> String {
        self.keys.quota_key(subject, self.policy.period_index(&*self.clock))
    }

    /// Try to consume one grant for `subject` in the current period.
    ///
    /// The limit check and the increment are one indivisible store
    /// operation: under any number of concurrent callers, exactly
    /// `min(N, limit)` of N calls within one period are granted.
    pub async fn try_consume(&self, subject: &str) -> Result<QuotaDecision, StoreError> {
        let key = self.current_key(subject);
        let ttl = self.policy.until_rollover(&*self.clock);

        let reply = self.store.bounded_incr(&key, self.policy.limit, ttl).await?;
        if reply == REJECTED {
            debug!(subject, key = %key, limit = self.policy.limit, "quota exhausted");
            return Ok(QuotaDecision::Exhausted { limit: self.policy.limit, resets_in: ttl });
        }

        let used =
            u32::try_from(reply).map_err(|_| StoreError::Corrupt { key: key.clone() })?;
        debug!(subject, key = %key, used, "quota grant consumed");
        Ok(QuotaDecision::Granted { used, remaining: self.policy.limit.saturating_sub(used) })
    }

    /// Hand back one grant for `subject`, compensating a consume whose
    /// downstream side effect failed.
    ///
    /// Idempotent-safe: if the period rolled over and the counter expired,
    /// this is a no-op: the counter is never recreated and never goes
    /// negative. Note this compensation bounds the damage of a failed
    /// attempt; it does not make consume-then-create atomic.
    pub async fn refund(&self, subject: &str) -> Result<Refund, StoreError> {
        let key = self.current_key(subject);

        let reply = self.store.saturating_decr(&key).await?;
        if reply == REJECTED {
            debug!(subject, key = %key, "quota refund was a no-op (counter expired or zero)");
            return Ok(Refund::Noop);
        }

        let remaining_used =
            u32::try_from(reply).map_err(|_| StoreError::Corrupt { key: key.clone() })?;
        debug!(subject, key = %key, remaining_used, "quota grant refunded");
        Ok(Refund::Applied { remaining_used })
    }

    /// Grants left for `subject` this period. Advisory only: the admit path
    /// never bases a decision on this read.
    pub async fn remaining(&self, subject: &str) -> Result<u32, StoreError> {
        let key = self.current_key(subject);
        let used = self.store.read_count(&key).await?.unwrap_or(0);
        let used = u32::try_from(used.max(0)).unwrap_or(u32::MAX);
        Ok(self.policy.limit.saturating_sub(used))
    }
}
