//! In-memory store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};

use super::{CoordinationStore, StoreError, REJECTED};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_millis: u64,
}

/// `HashMap`-backed store with lazy TTL expiry.
///
/// A single mutex stands in for the store-side atomicity contract: every
/// trait method takes the lock exactly once, so no caller can observe a
/// partial check-then-act. Expiry is driven by an injected [`Clock`], which
/// lets tests roll periods over and expire leases without sleeping.
///
/// [`set_available`](MemoryStore::set_available) simulates a store outage so
/// fail-closed paths can be exercised.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Store driven by the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store driven by the given clock (use [`crate::ManualClock`] in tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle a simulated outage. While unavailable every operation returns
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    /// Whether a live (non-expired) entry exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut map = match self.entries.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::live_entry(&mut map, key, now).is_some()
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable { reason: "simulated outage".into() });
        }
        Ok(match self.entries.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// Drop the entry under `key` if it has expired.
    fn evict_expired(map: &mut HashMap<String, Entry>, key: &str, now_millis: u64) {
        if map.get(key).is_some_and(|e| e.expires_at_millis <= now_millis) {
            map.remove(key);
        }
    }

    /// Drop the entry if it has expired, then return what is left.
    fn live_entry<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now_millis: u64,
    ) -> Option<&'a mut Entry> {
        Self::evict_expired(map, key, now_millis);
        map.get_mut(key)
    }

    fn parse_count(entry: &Entry, key: &str) -> Result<i64, StoreError> {
        entry.value.parse::<i64>().map_err(|_| StoreError::Corrupt { key: key.to_string() })
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn bounded_incr(&self, key: &str, limit: u32, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);
        let mut map = self.guard()?;

        Self::evict_expired(&mut map, key, now);
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: "0".into(), expires_at_millis: expires_at });

        let current = Self::parse_count(entry, key)?;
        if current >= i64::from(limit) {
            return Ok(REJECTED);
        }
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn saturating_decr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.guard()?;

        let Some(entry) = Self::live_entry(&mut map, key, now) else {
            return Ok(REJECTED);
        };
        let current = Self::parse_count(entry, key)?;
        if current <= 0 {
            return Ok(REJECTED);
        }
        let next = current - 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn read_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.guard()?;

        match Self::live_entry(&mut map, key, now) {
            Some(entry) => Ok(Some(Self::parse_count(entry, key)?)),
            None => Ok(None),
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);
        let mut map = self.guard()?;

        if Self::live_entry(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry { value: token.to_string(), expires_at_millis: expires_at });
        Ok(true)
    }

    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.guard()?;

        let held = Self::live_entry(&mut map, key, now).is_some_and(|e| e.value == token);
        if held {
            map.remove(key);
        }
        Ok(held)
    }
}
