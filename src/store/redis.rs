//! Redis-backed store.
//!
//! The limit check and the increment (and the token check and the delete)
//! run as server-side Lua scripts, so each operation is one indivisible
//! round trip regardless of how many processes share the store. Lock
//! acquisition uses plain `SET key token NX PX ms`, which Redis already
//! executes atomically.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;

use super::{CoordinationStore, StoreError};

/// KEYS[1] = counter key, ARGV[1] = limit, ARGV[2] = TTL seconds.
///
/// Initializes an absent key to 0 with the TTL, rejects with -1 once the
/// limit is reached, otherwise increments. INCR preserves the existing TTL.
const BOUNDED_INCR: &str = r"
local v = redis.call('GET', KEYS[1])
if not v then
  redis.call('SET', KEYS[1], 0, 'EX', tonumber(ARGV[2]))
  v = 0
else
  v = tonumber(v)
end
if v >= tonumber(ARGV[1]) then
  return -1
end
return redis.call('INCR', KEYS[1])
";

/// KEYS[1] = counter key.
///
/// Returns -1 without writing when the key is absent or already zero, so a
/// compensation after period rollover never recreates the counter.
const SATURATING_DECR: &str = r"
local v = redis.call('GET', KEYS[1])
if not v or tonumber(v) <= 0 then
  return -1
end
return redis.call('DECR', KEYS[1])
";

/// KEYS[1] = lock key, ARGV[1] = holder token.
const DELETE_IF_MATCH: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// [`CoordinationStore`] backed by a Redis server.
pub struct RedisStore {
    conn: MultiplexedConnection,
    bounded_incr: Script,
    saturating_decr: Script,
    delete_if_match: Script,
}

impl RedisStore {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        Ok(Self::with_connection(conn))
    }

    /// Build a store over an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            bounded_incr: Script::new(BOUNDED_INCR),
            saturating_decr: Script::new(SATURATING_DECR),
            delete_if_match: Script::new(DELETE_IF_MATCH),
        }
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable { reason: err.to_string() }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Round up: a counter must never expire before its period ends, or a
    // consume in the final fraction of a second would re-initialize it under
    // the same period key. Outliving the boundary is harmless since the next
    // period uses a fresh key. EX also refuses 0.
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn bounded_incr(&self, key: &str, limit: u32, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .bounded_incr
            .key(key)
            .arg(limit)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply)
    }

    async fn saturating_decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 =
            self.saturating_decr.key(key).invoke_async(&mut conn).await.map_err(unavailable)?;
        Ok(reply)
    }

    async fn read_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(unavailable)?;
        match reply {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StoreError::Corrupt { key: key.to_string() }),
            None => Ok(None),
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let lease_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn delete_if_match(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_match
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }
}
