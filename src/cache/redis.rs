//! Redis store backend.

use super::backend::{Connector, KvBackend, WindowCount};
use super::key::HITS_SUFFIX;
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Increment the hit counter and re-apply the key's own remaining TTL to the
/// key and its counter, then return the value. Missing keys are not touched.
pub const READ_WITH_HITS_SCRIPT: &str = r#"
local key = KEYS[1]
local hit_counter_key = key .. ARGV[1]

local value = redis.call('GET', key)
if not value then
  return false
end

local ttl = redis.call('PTTL', key)
redis.call('INCR', hit_counter_key)
if ttl > 0 then
  redis.call('PEXPIRE', key, ttl)
  redis.call('PEXPIRE', hit_counter_key, ttl)
else
  redis.call('PERSIST', hit_counter_key)
end

return value
"#;

/// Fixed-window counter: the expiry is set when the window opens and never
/// extended afterwards. Returns `{count, pttl}`.
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local window_ms = tonumber(ARGV[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], window_ms)
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], window_ms)
  ttl = window_ms
end
return {count, ttl}
"#;

/// Number of keys to scan per iteration
const SCAN_BATCH_SIZE: usize = 100;

/// Redis-backed store over a multiplexed, auto-reconnecting connection.
///
/// The connection manager pipelines commands from concurrent callers over a
/// single connection; cloning it is cheap and shares that connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    read_script: Script,
    window_script: Script,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            read_script: Script::new(READ_WITH_HITS_SCRIPT),
            window_script: Script::new(FIXED_WINDOW_SCRIPT),
        }
    }
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        for source in [READ_WITH_HITS_SCRIPT, FIXED_WINDOW_SCRIPT] {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(source)
                .query_async(&mut conn)
                .await?;
            debug!(sha = %sha, "loaded store script");
        }
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_with_hits(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = self
            .read_script
            .key(key)
            .arg(HITS_SUFFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.conn.clone();
        let (count, pttl): (i64, i64) = self
            .window_script
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowCount {
            count: count.max(0) as u64,
            remaining: Duration::from_millis(pttl.max(0) as u64),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn preview(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        let mut conn = self.conn.clone();
        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut conn).await?;
        if kind != "string" {
            return Ok(None);
        }
        let (value, ttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|v| (v, ttl)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // SCAN may return a key more than once
        let mut found = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(found.into_iter().collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }

    async fn flush_all(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHALL").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Opens `redis://host:port/db` connections.
pub struct RedisConnector {
    host: String,
    port: u16,
    db: i64,
}

impl RedisConnector {
    pub fn new(host: impl Into<String>, port: u16, db: i64) -> Self {
        Self {
            host: host.into(),
            port,
            db,
        }
    }

    /// Parse a `redis://host[:port][/db]` url, defaulting port 6379 and db 0.
    pub fn from_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("redis://")?;
        let (authority, db) = match rest.split_once('/') {
            Some((a, d)) if !d.is_empty() => (a, d.parse().ok()?),
            Some((a, _)) => (a, 0),
            None => (rest, 0),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse().ok()?),
            None => (authority, 6379),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port, db))
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn KvBackend>> {
        let client = redis::Client::open(self.url())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Arc::new(RedisBackend::new(conn)))
    }

    fn describe(&self) -> String {
        self.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_url() {
        let c = RedisConnector::new("cache.internal", 6380, 2);
        assert_eq!(c.url(), "redis://cache.internal:6380/2");
        assert_eq!(c.describe(), c.url());
    }

    #[test]
    fn test_connector_from_url() {
        let c = RedisConnector::from_url("redis://127.0.0.1").unwrap();
        assert_eq!(c.url(), "redis://127.0.0.1:6379/0");

        let c = RedisConnector::from_url("redis://localhost:6390/3").unwrap();
        assert_eq!(c.url(), "redis://localhost:6390/3");

        assert!(RedisConnector::from_url("http://localhost").is_none());
        assert!(RedisConnector::from_url("redis://:6379").is_none());
        assert!(RedisConnector::from_url("redis://host:notaport").is_none());
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
