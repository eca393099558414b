//! Redis-backed [`CacheStore`], enabled by the `redis-cache` feature.
//!
//! Entries are stored as JSON under `{prefix}{slot}` with `SET EX`, so Redis
//! expires them on its own as well as the cache layer checking TTL on read.
//! Capacity is Redis's concern (`maxmemory` + an LRU eviction policy); the
//! `[cache] capacity` setting only applies to the in-memory store.
//!
//! `len` walks the key space with `SCAN`, so its result is kept for
//! [`LEN_MAX_AGE`] and shared by every stats and metrics read in that window.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use lightning_serve_core::cache::{CacheEntry, CacheStore};

/// How long a counted entry total is reported before the next `SCAN`.
pub const LEN_MAX_AGE: Duration = Duration::from_secs(30);

pub struct RedisCacheStore {
    connection: MultiplexedConnection,
    prefix: String,
    /// Last `SCAN` total and when it was taken. The lock is held while
    /// counting so concurrent readers wait for one scan instead of starting
    /// their own.
    counted: Mutex<Option<(Instant, usize)>>,
}

impl RedisCacheStore {
    /// Open a multiplexed connection and verify it with `PING`.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .context("Redis PING failed")?;
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            counted: Mutex::new(None),
        })
    }

    fn key(&self, slot: &str) -> String {
        format!("{}{}", self.prefix, slot)
    }

    async fn scan_count(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut count = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }
}

/// A previous count still answers `len` if it is younger than `max_age`.
fn reusable_count(counted: Option<(Instant, usize)>, now: Instant, max_age: Duration) -> Option<usize> {
    counted
        .filter(|(taken, _)| now.saturating_duration_since(*taken) < max_age)
        .map(|(_, count)| count)
}

/// Expiry in whole seconds for `SET EX`, rounded up. `0` means no expiry.
fn expiry_secs(ttl_ms: u64) -> Option<u64> {
    (ttl_ms > 0).then(|| ttl_ms.div_ceil(1000))
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, slot: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.key(slot)).await?;
        match value {
            Some(json) => {
                let entry = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt cache entry at {}", self.key(slot)))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, slot: &str, entry: CacheEntry) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&entry)?;
        match expiry_secs(entry.ttl_ms) {
            Some(secs) => conn.set_ex::<_, _, ()>(self.key(slot), json, secs).await?,
            None => conn.set::<_, _, ()>(self.key(slot), json).await?,
        }
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.key(slot)).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut counted = self.counted.lock().await;
        if let Some(count) = reusable_count(*counted, Instant::now(), LEN_MAX_AGE) {
            return Ok(count);
        }
        let count = self.scan_count().await?;
        *counted = Some((Instant::now(), count));
        Ok(count)
    }
}
