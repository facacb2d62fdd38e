//! Lease-based distributed lock keyed by subject.
//!
//! Acquisition is an atomic set-if-absent-with-expiry carrying a
//! caller-unique token; release is a token-checked compare-and-delete, so a
//! slow holder whose lease expired can never delete a lease acquired by a
//! later holder. If a holder crashes, the lease expires on its own and a new
//! acquirer may proceed; worst-case unavailability is bounded by the lease
//! duration.
//!
//! Waiters retry with jittered exponential backoff up to a wait timeout;
//! they are not served in FIFO order, and starvation under heavy contention
//! is possible and accepted.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{CoordinationStore, KeySpace, StoreError};

/// Configuration for the subject lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration; the lock self-heals after this long without release.
    pub lease: Duration,
    /// Maximum time an acquirer waits before giving up.
    pub wait_timeout: Duration,
    /// Initial retry backoff.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of a bounded-wait acquisition.
///
/// Timing out is a normal outcome for a contended lock, not a fault, so it
/// is a tagged variant rather than an error.
pub enum Acquisition<S: CoordinationStore + ?Sized + 'static> {
    /// The lock was acquired; the guard owns the lease.
    Acquired(LockGuard<S>),
    /// The wait timeout elapsed without acquiring the lock.
    TimedOut {
        /// How long the caller waited.
        waited: Duration,
    },
}

impl<S: CoordinationStore + ?Sized + 'static> Acquisition<S> {
    /// Helper to check if the lock was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// A distributed mutex scoped to one subject at a time.
///
/// At most one live, non-expired lease exists per lock key at any instant.
pub struct SubjectLock<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    keys: KeySpace,
    config: LockConfig,
}

impl<S: CoordinationStore + ?Sized + 'static> SubjectLock<S> {
    /// Create a lock over `store`.
    pub fn new(store: Arc<S>, keys: KeySpace, config: LockConfig) -> Self {
        Self { store, keys, config }
    }

    /// The lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Attempt to take the lock for `subject` without waiting.
    pub async fn try_acquire(&self, subject: &str) -> Result<Option<LockGuard<S>>, StoreError> {
        let key = self.keys.lock_key(subject);
        let token = Uuid::new_v4().to_string();

        if self.store.put_if_absent(&key, &token, self.config.lease).await? {
            debug!(subject, key = %key, "lock acquired");
            Ok(Some(LockGuard { store: self.store.clone(), key, token, released: false }))
        } else {
            Ok(None)
        }
    }

    /// Take the lock for `subject`, waiting up to the configured timeout.
    ///
    /// Retries with jittered exponential backoff between attempts.
    pub async fn acquire(&self, subject: &str) -> Result<Acquisition<S>, StoreError> {
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;
        let mut backoff = self.config.initial_backoff;

        loop {
            if let Some(guard) = self.try_acquire(subject).await? {
                return Ok(Acquisition::Acquired(guard));
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = started.elapsed();
                debug!(subject, waited_ms = waited.as_millis() as u64, "lock wait timed out");
                return Ok(Acquisition::TimedOut { waited });
            }

            // Jittered exponential backoff, clamped to the remaining wait
            // budget. Create the rng inline so no non-Send type is held
            // across the await.
            let backoff_ms = backoff.as_millis() as u64;
            let jitter_ms = rand::rng().random_range(0..backoff_ms / 2 + 1);
            let sleep_for =
                Duration::from_millis(backoff_ms + jitter_ms).min(deadline - now);

            debug!(subject, sleep_ms = sleep_for.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(sleep_for).await;

            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

/// Ownership of one lease. Created by [`SubjectLock::acquire`].
///
/// Dropping the guard releases the lease best-effort in a background task;
/// prefer calling [`release`](LockGuard::release) so release faults are
/// observable. Either way the lease TTL is the backstop.
pub struct LockGuard<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    token: String,
    released: bool,
}

impl<S: CoordinationStore + ?Sized + 'static> LockGuard<S> {
    /// The lock key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The opaque ownership token for this lease.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lease.
    ///
    /// Deletes the lock key only if it still holds this guard's token.
    /// Returns `false` when the lease had already expired (and possibly been
    /// re-acquired by another holder); in that case nothing is deleted.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        let deleted = self.store.delete_if_match(&self.key, &self.token).await?;
        if deleted {
            debug!(key = %self.key, "lock released");
        } else {
            warn!(key = %self.key, "lock release found no matching lease (expired or taken over)");
        }
        Ok(deleted)
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match store.delete_if_match(&key, &token).await {
                    Ok(_) => debug!(key = %key, "lock released on drop"),
                    Err(err) => {
                        debug!(key = %key, error = %err, "lock release on drop failed (lease will expire)");
                    }
                }
            });
        }
        // Without a runtime the lease simply expires.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;

    fn lock_with(
        config: LockConfig,
    ) -> (SubjectLock<MemoryStore>, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let lock = SubjectLock::new(store.clone(), KeySpace::default(), config);
        (lock, store, clock)
    }

    #[tokio::test]
    async fn mutual_exclusion() {
        let (lock, _store, _clock) = lock_with(LockConfig::default());

        let guard = lock.try_acquire("user-1").await.unwrap().expect("first acquire");
        assert!(lock.try_acquire("user-1").await.unwrap().is_none());

        assert!(guard.release().await.unwrap());
        assert!(lock.try_acquire("user-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn different_subjects_do_not_contend() {
        let (lock, _store, _clock) = lock_with(LockConfig::default());

        let _a = lock.try_acquire("a").await.unwrap().expect("a");
        assert!(lock.try_acquire("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_acquirable() {
        let config = LockConfig { lease: Duration::from_secs(5), ..LockConfig::default() };
        let (lock, _store, clock) = lock_with(config);

        let _held = lock.try_acquire("user-1").await.unwrap().expect("first acquire");
        assert!(lock.try_acquire("user-1").await.unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        assert!(lock.try_acquire("user-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_does_not_break_new_holder() {
        let config = LockConfig { lease: Duration::from_secs(5), ..LockConfig::default() };
        let (lock, store, clock) = lock_with(config);

        let stale = lock.try_acquire("user-1").await.unwrap().expect("first acquire");
        clock.advance(Duration::from_secs(5));
        let _fresh = lock.try_acquire("user-1").await.unwrap().expect("takeover");

        // The stale holder's release must not delete the fresh lease.
        assert!(!stale.release().await.unwrap());
        assert!(store.contains("quotagate:lock:user-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_while_held() {
        let config = LockConfig {
            wait_timeout: Duration::from_secs(1),
            ..LockConfig::default()
        };
        let (lock, _store, _clock) = lock_with(config);

        let _held = lock.try_acquire("user-1").await.unwrap().expect("first acquire");

        match lock.acquire("user-1").await.unwrap() {
            Acquisition::TimedOut { waited } => assert!(waited >= Duration::from_secs(1)),
            Acquisition::Acquired(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_after_release() {
        let (lock, _store, _clock) = lock_with(LockConfig::default());
        let lock = Arc::new(lock);

        let guard = lock.try_acquire("user-1").await.unwrap().expect("first acquire");

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("user-1").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release().await.unwrap();

        let acquisition = waiter.await.unwrap().unwrap();
        assert!(acquisition.is_acquired());
    }

    #[tokio::test]
    async fn drop_releases_best_effort() {
        let (lock, store, _clock) = lock_with(LockConfig::default());

        {
            let _guard = lock.try_acquire("user-1").await.unwrap().expect("acquire");
        }
        // Give the spawned release task a chance to run.
        for _ in 0..100 {
            if !store.contains("quotagate:lock:user-1") {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!store.contains("quotagate:lock:user-1"));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_error() {
        let (lock, store, _clock) = lock_with(LockConfig::default());
        store.set_available(false);

        assert!(lock.try_acquire("user-1").await.is_err());
    }
}
