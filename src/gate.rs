//! Creation gate: serialized, quota-bounded admission for a side-effecting
//! resource creation.
//!
//! Per request the gate acquires the subject's lock with a bounded wait,
//! consumes one quota grant, runs the creation side effect, and releases the
//! lock on every exit path. If the side effect fails, the consumed grant is
//! refunded best-effort. Store faults fail closed: the request is rejected
//! rather than risking a quota bypass.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::GateError;
use crate::lock::{Acquisition, LockConfig, LockGuard, SubjectLock};
use crate::quota::{QuotaCounter, QuotaDecision, QuotaPolicy};
use crate::store::{CoordinationStore, KeySpace, StoreError};

/// Gate guarding creation of a scarce, per-subject, quota-limited resource.
///
/// The store is the sole owner of quota and lease state; the gate makes
/// every decision by calling into it and caches nothing between requests,
/// so any number of gate instances across processes stay consistent.
pub struct CreationGate<S: CoordinationStore + ?Sized + 'static> {
    lock: SubjectLock<S>,
    quota: QuotaCounter<S>,
}

impl<S: CoordinationStore + ?Sized + 'static> CreationGate<S> {
    /// Start building a gate over `store`.
    pub fn builder(store: Arc<S>) -> GateBuilder<S> {
        GateBuilder {
            store,
            policy: QuotaPolicy::daily(1),
            lock: LockConfig::default(),
            keys: KeySpace::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// The quota policy this gate enforces.
    pub fn policy(&self) -> &QuotaPolicy {
        self.quota.policy()
    }

    /// Admit one creation request for `subject`.
    ///
    /// `operation` is the side-effecting creation call; it runs only while
    /// the subject's lock is held and after a quota grant was consumed.
    /// Expected rejections come back as [`GateError::QuotaExhausted`] and
    /// [`GateError::Busy`]; a `Busy` outcome should be surfaced as "try
    /// again shortly", not retried indefinitely.
    pub async fn admit<T, E, Fut, Op>(&self, subject: &str, operation: Op) -> Result<T, GateError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let guard = match self.lock.acquire(subject).await? {
            Acquisition::Acquired(guard) => guard,
            Acquisition::TimedOut { waited } => {
                return Err(GateError::Busy { waited, timeout: self.lock.config().wait_timeout });
            }
        };

        let decision = match self.quota.try_consume(subject).await {
            Ok(decision) => decision,
            Err(err) => {
                // Fail closed: an unreachable store rejects the request.
                Self::release(guard, subject).await;
                return Err(GateError::Store(err));
            }
        };

        if let QuotaDecision::Exhausted { limit, resets_in } = decision {
            Self::release(guard, subject).await;
            return Err(GateError::QuotaExhausted { limit, resets_in });
        }

        let result = operation().await;

        if result.is_err() {
            // Hand the grant back so a failed attempt does not cost quota.
            // A store fault here only costs the subject one grant until
            // rollover, so it is logged and swallowed.
            match self.quota.refund(subject).await {
                Ok(refund) => debug!(subject, ?refund, "refunded after failed creation"),
                Err(err) => warn!(subject, error = %err, "quota refund failed"),
            }
        }

        Self::release(guard, subject).await;
        result.map_err(GateError::Inner)
    }

    /// Grants left for `subject` this period. Advisory only.
    pub async fn remaining(&self, subject: &str) -> Result<u32, StoreError> {
        self.quota.remaining(subject).await
    }

    async fn release(guard: LockGuard<S>, subject: &str) {
        if let Err(err) = guard.release().await {
            // The lease TTL bounds how long the subject stays blocked.
            warn!(subject, error = %err, "lock release failed (lease will expire)");
        }
    }
}

/// Builder for [`CreationGate`].
pub struct GateBuilder<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    policy: QuotaPolicy,
    lock: LockConfig,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl<S: CoordinationStore + ?Sized + 'static> GateBuilder<S> {
    /// Set the quota policy (default: one grant per day).
    pub fn policy(mut self, policy: QuotaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the lock configuration.
    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock = config;
        self
    }

    /// Set the key namespace (default: `quotagate`).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.keys = KeySpace::new(namespace);
        self
    }

    /// Inject a clock (tests use [`crate::ManualClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the gate.
    pub fn build(self) -> CreationGate<S> {
        CreationGate {
            lock: SubjectLock::new(self.store.clone(), self.keys.clone(), self.lock),
            quota: QuotaCounter::new(self.store, self.keys, self.policy, self.clock),
        }
    }
}
