//! Process-wide handle to the shared store.

use super::backend::{Connector, KvBackend, WindowCount};
use super::key::{hits_key, is_hits_key};
use crate::resilience::breaker::{ReconnectBreaker, ReconnectBreakerConfig, ReconnectBreakerSnapshot};
use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Characters of a value shown by [`SharedCache::list_all`].
pub const PREVIEW_CHARS: usize = 16;

#[derive(Debug, Clone)]
pub struct SharedCacheConfig {
    pub default_ttl: Duration,
    pub connect_timeout: Duration,
    pub op_timeout: Duration,
    pub reconnect_cooldown: Duration,
    /// Consecutive failed connects before the cooldown starts.
    pub reconnect_failures: u32,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(20),
            op_timeout: Duration::from_secs(20),
            reconnect_cooldown: Duration::from_secs(5),
            reconnect_failures: 1,
        }
    }
}

impl SharedCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }
    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }
    pub fn with_reconnect_failures(mut self, failures: u32) -> Self {
        self.reconnect_failures = failures;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// One row of [`CacheListing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedEntry {
    /// First [`PREVIEW_CHARS`] characters of the value.
    pub value: Option<String>,
    /// Remaining TTL in seconds, -1 for keys without expiry.
    pub ttl: i64,
}

/// Diagnostic dump of the namespace. Serializes flat: `{"<key>": {..}, "total": n}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheListing {
    #[serde(flatten)]
    pub entries: BTreeMap<String, ListedEntry>,
    /// Keys seen by the scan, including ones skipped for their value type.
    pub total: usize,
}

/// Outcome of [`SharedCache::delete_by_pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternDeletion {
    pub pattern: String,
    pub matched: usize,
    pub deleted: u64,
}

impl PatternDeletion {
    pub fn any_matched(&self) -> bool {
        self.matched > 0
    }

    pub fn status(&self) -> String {
        if self.any_matched() {
            "ok".to_string()
        } else {
            format!("no keys found for pattern: {}", self.pattern)
        }
    }
}

/// Shared-store client for one process.
///
/// Construct once at the composition root and pass it (behind `Arc`) to every
/// component. The connection is opened lazily on first use, exactly once even
/// under concurrent first use, and then reused by all callers. Every operation
/// yields [`Error::CacheUnavailable`] while the store cannot be reached.
pub struct SharedCache {
    connector: Arc<dyn Connector>,
    handle: OnceCell<Arc<dyn KvBackend>>,
    breaker: ReconnectBreaker,
    config: SharedCacheConfig,
    stats: AtomicStats,
}

impl SharedCache {
    pub fn new(connector: Arc<dyn Connector>, config: SharedCacheConfig) -> Self {
        let breaker = ReconnectBreaker::new(
            ReconnectBreakerConfig::new()
                .with_cooldown(config.reconnect_cooldown)
                .with_failure_threshold(config.reconnect_failures),
        );
        Self {
            connector,
            handle: OnceCell::new(),
            breaker,
            config,
            stats: AtomicStats::default(),
        }
    }

    pub fn config(&self) -> &SharedCacheConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.handle.initialized()
    }

    /// Establish the connection if needed. Never fails: on any transport
    /// error the cause is logged and the cache stays disconnected.
    pub async fn connect(&self) -> bool {
        if self.handle.initialized() {
            return true;
        }
        match self.handle.get_or_try_init(|| self.open()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "shared cache disconnected");
                false
            }
        }
    }

    async fn open(&self) -> Result<Arc<dyn KvBackend>> {
        self.breaker.allow()?;
        let target = self.connector.describe();
        info!(target = %target, "connecting to shared store");

        let attempt = async {
            let backend = self.connector.connect().await?;
            backend.ping().await?;
            backend.prepare().await?;
            Ok::<_, Error>(backend)
        };
        let outcome = match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(res) => res,
            Err(_) => Err(Error::cache_unavailable_with_context(
                format!("connect timed out after {:?}", self.config.connect_timeout),
                ErrorContext::new()
                    .with_source("shared_cache")
                    .with_details(target.clone()),
            )),
        };
        match outcome {
            Ok(backend) => {
                self.breaker.on_success();
                info!(target = %target, backend = backend.name(), "connected to shared store");
                Ok(backend)
            }
            Err(e) => {
                self.breaker.on_failure();
                warn!(target = %target, error = %e, "could not connect to shared store");
                Err(e)
            }
        }
    }

    /// Typed "not ready" check at the top of every operation.
    async fn backend(&self) -> Result<Arc<dyn KvBackend>> {
        if let Some(b) = self.handle.get() {
            return Ok(b.clone());
        }
        if self.connect().await {
            if let Some(b) = self.handle.get() {
                return Ok(b.clone());
            }
        }
        Err(Error::cache_unavailable("shared store client is not connected"))
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn KvBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = self.backend().await?;
        let outcome = match tokio::time::timeout(self.config.op_timeout, f(backend)).await {
            Ok(res) => res,
            Err(_) => Err(Error::cache_unavailable_with_context(
                format!("{} timed out after {:?}", op, self.config.op_timeout),
                ErrorContext::new().with_source("shared_cache"),
            )),
        };
        if let Err(ref e) = outcome {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            debug!(op, error = %e, "shared cache operation failed");
        }
        outcome
    }

    /// Write `value` under `key`, replacing any previous value and expiry.
    /// `None` uses the configured default TTL.
    pub async fn store(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.run("store", |b| async move { b.set_ex(key, value, ttl).await })
            .await?;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn store_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.store(key, &data, ttl).await
    }

    /// Atomic read that bumps `<key>:hits` and keeps both keys on the key's
    /// current expiry. Absent keys return `None` with no side effects.
    /// Hit counter keys themselves cannot be read this way.
    pub async fn read_with_hit_tracking(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if is_hits_key(key) {
            return Err(Error::validation_with_context(
                format!("{} is a hit counter, not a cached value", key),
                ErrorContext::new().with_source("shared_cache"),
            ));
        }
        debug!(key = %key, "reading shared cache key");
        let value = self
            .run("read_with_hit_tracking", |b| async move {
                b.get_with_hits(key).await
            })
            .await?;
        match value {
            Some(_) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                if tracing::enabled!(tracing::Level::DEBUG) {
                    if let Ok(hits) = self.hit_count(key).await {
                        debug!(key = %key, hits, "cache hit");
                    }
                }
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(value)
    }

    /// [`read_with_hit_tracking`](Self::read_with_hit_tracking) decoding JSON.
    /// Values that fail to decode count as errors and read as a miss.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_with_hit_tracking(key).await? {
            Some(data) => match serde_json::from_slice(&data) {
                Ok(val) => Ok(Some(val)),
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "cached value is not valid JSON");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn hit_count(&self, key: &str) -> Result<u64> {
        let counter = hits_key(key);
        let raw = self
            .run("hit_count", |b| {
                let counter = counter.as_str();
                async move { b.get(counter).await }
            })
            .await?;
        Ok(raw
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.run("exists", |b| async move { b.exists(key).await })
            .await
    }

    /// Fixed-window counter for admission control. Unlike reads, this never
    /// extends the key's expiry once the window has opened.
    pub async fn increment_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        self.run("increment_window", |b| async move {
            b.incr_window(key, window).await
        })
        .await
    }

    /// Enumerate every key with a value preview and TTL. Diagnostics only:
    /// cost grows with the size of the namespace.
    pub async fn list_all(&self) -> Result<CacheListing> {
        let keys = self
            .run("list_all", |b| async move { b.keys("*").await })
            .await?;
        let mut listing = CacheListing {
            entries: BTreeMap::new(),
            total: keys.len(),
        };
        for key in keys {
            let k = key.as_str();
            let preview = self
                .run("list_all", |b| async move { b.preview(k).await })
                .await?;
            if let Some((data, ttl)) = preview {
                let value = String::from_utf8_lossy(&data)
                    .chars()
                    .take(PREVIEW_CHARS)
                    .collect::<String>();
                listing.entries.insert(
                    key,
                    ListedEntry {
                        value: (!value.is_empty()).then_some(value),
                        ttl,
                    },
                );
            }
        }
        Ok(listing)
    }

    pub async fn delete_by_key(&self, key: &str) -> Result<u64> {
        info!(key = %key, "deleting shared cache entry");
        let keys = [key.to_string()];
        let deleted = self
            .run("delete_by_key", |b| {
                let keys = &keys;
                async move { b.delete(keys).await }
            })
            .await?;
        self.stats.deletes.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<PatternDeletion> {
        warn!(pattern = %pattern, "deleting shared cache entries by pattern");
        let keys = self
            .run("delete_by_pattern", |b| async move { b.keys(pattern).await })
            .await?;
        let deleted = if keys.is_empty() {
            0
        } else {
            let keys = &keys;
            self.run("delete_by_pattern", |b| async move { b.delete(keys).await })
                .await?
        };
        self.stats.deletes.fetch_add(deleted, Ordering::Relaxed);
        Ok(PatternDeletion {
            pattern: pattern.to_string(),
            matched: keys.len(),
            deleted,
        })
    }

    /// Wipe the whole store. Administrative use only.
    pub async fn flush_all(&self) -> Result<()> {
        warn!("flushing all shared cache entries");
        self.run("flush_all", |b| async move { b.flush_all().await })
            .await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn breaker_snapshot(&self) -> ReconnectBreakerSnapshot {
        self.breaker.snapshot()
    }
}
