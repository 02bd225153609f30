//! Store backends behind the shared cache.

use super::key::hits_key;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Counter state of a fixed-window key after one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    /// Time left until the window key expires.
    pub remaining: Duration,
}

/// Raw key-value operations the shared cache needs from a store.
///
/// `get_with_hits` and `incr_window` must each execute as one indivisible unit
/// with respect to concurrent callers on the same key, across processes.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn ping(&self) -> Result<()>;
    /// Load server-side scripts ahead of first use.
    async fn prepare(&self) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Increment `<key>:hits`, re-apply the key's remaining TTL to both keys and
    /// return the value. Absent keys yield `None` and are left untouched.
    async fn get_with_hits(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Fixed-window increment: the expiry is set only when the window opens.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Value and TTL in seconds (-1 when the key has no expiry) of a string key.
    /// Keys holding other value types yield `None`.
    async fn preview(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn flush_all(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Factory for live backend handles, invoked once per successful connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn KvBackend>>;
    /// Human-readable target for logs (never includes credentials).
    fn describe(&self) -> String;
}

#[derive(Clone)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process store with the same atomicity contract as the Redis backend.
///
/// Every operation runs under one lock, so the multi-step operations are
/// indivisible. Clones share state, which lets several `SharedCache`
/// instances stand in for several processes talking to one store.
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a store outage: every operation and connect attempt fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key, `None` if absent or persistent.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn state(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::cache_unavailable_with_context(
                "memory store offline",
                ErrorContext::new().with_source("memory_backend"),
            ));
        }
        self.entries.lock().map_err(|_| {
            Error::runtime_with_context(
                "memory store poisoned",
                ErrorContext::new().with_source("memory_backend"),
            )
        })
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, e| !e.is_expired(now));
    }

    fn parse_counter(data: &[u8]) -> Result<i64> {
        std::str::from_utf8(data)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                Error::validation_with_context(
                    "value is not an integer",
                    ErrorContext::new().with_source("memory_backend"),
                )
            })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    async fn prepare(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.state()?;
        entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get_with_hits(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.state()?;
        let now = Instant::now();
        let (data, expires_at) = match Self::live(&mut entries, key, now) {
            Some(e) => (e.data.clone(), e.expires_at),
            None => return Ok(None),
        };

        let hits = hits_key(key);
        let current = match Self::live(&mut entries, &hits, now) {
            Some(e) => Self::parse_counter(&e.data)?,
            None => 0,
        };
        entries.insert(
            hits,
            Entry {
                data: (current + 1).to_string().into_bytes(),
                expires_at,
            },
        );
        // the primary key keeps its own expiry, re-applied unchanged
        if let Some(e) = entries.get_mut(key) {
            e.expires_at = expires_at;
        }
        Ok(Some(data))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut entries = self.state()?;
        let now = Instant::now();
        let entry = match Self::live(&mut entries, key, now) {
            Some(e) => {
                let count = Self::parse_counter(&e.data)? + 1;
                e.data = count.to_string().into_bytes();
                if e.expires_at.is_none() {
                    e.expires_at = Some(now + window);
                }
                e.clone()
            }
            None => {
                let e = Entry {
                    data: b"1".to_vec(),
                    expires_at: Some(now + window),
                };
                entries.insert(key.to_string(), e.clone());
                e
            }
        };
        Ok(WindowCount {
            count: Self::parse_counter(&entry.data)?.max(0) as u64,
            remaining: entry
                .expires_at
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(window),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.state()?;
        Ok(Self::live(&mut entries, key, Instant::now()).map(|e| e.data.clone()))
    }

    async fn preview(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>> {
        let mut entries = self.state()?;
        let now = Instant::now();
        Ok(Self::live(&mut entries, key, now).map(|e| {
            let ttl = e
                .expires_at
                .map(|at| at.saturating_duration_since(now).as_secs() as i64)
                .unwrap_or(-1);
            (e.data.clone(), ttl)
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.state()?;
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let mut entries = self.state()?;
        Self::purge_expired(&mut entries, Instant::now());
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut entries = self.state()?;
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some(e) = entries.remove(key) {
                if !e.is_expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn flush_all(&self) -> Result<()> {
        self.state()?.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Arc<dyn KvBackend>> {
        self.ping().await?;
        Ok(Arc::new(self.clone()))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

/// Translate a Redis-style glob (`*`, `?`, `[...]`, `\` escapes) to an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 6);
    out.push_str("(?s)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' || inner == '&' || inner == '~' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return Err(Error::validation_with_context(
                        "unterminated character class",
                        ErrorContext::new()
                            .with_field_path("pattern")
                            .with_details(pattern.to_string()),
                    ));
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| {
        Error::validation_with_context(
            format!("invalid key pattern: {}", e),
            ErrorContext::new().with_field_path("pattern"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("answer:*").unwrap();
        assert!(re.is_match("answer:abc"));
        assert!(re.is_match("answer:"));
        assert!(!re.is_match("rate-limit:answer:abc"));

        let re = glob_to_regex("h?llo").unwrap();
        assert!(re.is_match("hello"));
        assert!(!re.is_match("heello"));

        let re = glob_to_regex("h[ae]llo").unwrap();
        assert!(re.is_match("hallo"));
        assert!(!re.is_match("hillo"));

        let re = glob_to_regex("h[^e]llo").unwrap();
        assert!(re.is_match("hallo"));
        assert!(!re.is_match("hello"));

        let re = glob_to_regex(r"literal\*.key").unwrap();
        assert!(re.is_match("literal*.key"));
        assert!(!re.is_match("literalX.key"));
    }

    #[test]
    fn test_glob_unterminated_class_is_rejected() {
        assert!(glob_to_regex("key[abc").is_err());
    }

    #[tokio::test]
    async fn test_offline_backend_reports_cache_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_cache_unavailable());
        assert!(backend.connect().await.is_err());

        backend.set_offline(false);
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let backend = MemoryBackend::new();
        backend
            .set_ex("k", b"v", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(backend.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_window_keeps_original_boundary() {
        let backend = MemoryBackend::new();
        let window = Duration::from_secs(10);

        let first = backend.incr_window("w", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.remaining, window);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = backend.incr_window("w", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.remaining, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(7)).await;
        let fresh = backend.incr_window("w", window).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.remaining, window);
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_fails() {
        let backend = MemoryBackend::new();
        backend
            .set_ex("w", b"not-a-number", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(backend
            .incr_window("w", Duration::from_secs(10))
            .await
            .is_err());
    }
}
