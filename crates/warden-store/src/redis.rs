//! Redis-backed distributed `KvStore`.
//!
//! The sliding-window probe is a single Lua script over a sorted set keyed by
//! timestamp: evict expired members, count, and conditionally insert — one
//! atomic round trip, so two concurrent probes for the same key can never
//! both observe "under limit" when one slot remains.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use warden_types::errors::WardenError;
use warden_types::traits::KvStore;
use warden_types::WindowProbe;

/// Atomic read-evict-count-insert over a sorted set.
///
/// KEYS[1] window key; ARGV: now_ms, window_ms, cap, record(0/1), member.
/// Returns {allowed, count_after, oldest_score_or_0}.
const WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])
local record = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < cap then
  allowed = 1
  if record == 1 then
    redis.call('ZADD', KEYS[1], now, ARGV[5])
    redis.call('PEXPIRE', KEYS[1], window)
    count = count + 1
  end
end
local oldest = 0
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if first[2] then
  oldest = tonumber(first[2])
end
return {allowed, count, oldest}
"#;

/// Distributed key-value store backed by Redis.
///
/// The window script is compiled once at construction; the connection manager
/// reconnects transparently, and callers treat errors as a signal to fall
/// back to the in-process store.
pub struct RedisKvStore {
    manager: ConnectionManager,
    window_script: Script,
}

impl RedisKvStore {
    /// Connect to Redis at the given URL.
    pub async fn connect(url: &str) -> Result<Self, WardenError> {
        let client = redis::Client::open(url)
            .map_err(|e| WardenError::Store(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| WardenError::Store(format!("redis connection failed: {e}")))?;
        Ok(Self {
            manager,
            window_script: Script::new(WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn window_probe(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        cap: u32,
        record: bool,
    ) -> Result<WindowProbe, WardenError> {
        let mut conn = self.manager.clone();
        // Member must be unique even when two probes share a millisecond.
        let member = format!("{now_ms}-{}", Uuid::new_v4());

        let reply: Vec<i64> = self
            .window_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(cap)
            .arg(record as i32)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WardenError::Store(format!("window probe failed: {e}")))?;

        if reply.len() != 3 {
            return Err(WardenError::Store(format!(
                "window probe returned {} values, expected 3",
                reply.len()
            )));
        }

        Ok(WindowProbe {
            allowed: reply[0] == 1,
            count: reply[1].max(0) as u32,
            oldest_ms: if reply[2] > 0 { Some(reply[2]) } else { None },
        })
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl_ms: i64,
    ) -> Result<i64, WardenError> {
        let mut conn = self.manager.clone();
        let (value, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Store(format!("counter increment failed: {e}")))?;
        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> Result<i64, WardenError> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| WardenError::Store(format!("counter read failed: {e}")))?;
        Ok(value.unwrap_or(0))
    }

    async fn remove(&self, key: &str) -> Result<(), WardenError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| WardenError::Store(format!("delete failed: {e}")))?;
        Ok(())
    }
}
