use crate::cache::WindowCount;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Distinct clients kept before the least recently seen is evicted.
    pub max_clients: usize,
    /// Age since last request after which a record is dropped.
    pub retention: Duration,
    /// Distinct local quota windows kept for the admission fallback.
    pub max_windows: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_clients: 2048,
            retention: Duration::from_secs(3600),
            max_windows: 4096,
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_windows(mut self, max: usize) -> Self {
        self.max_windows = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientActivity {
    pub client_id: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time view of tracked clients, most recently seen first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivitySnapshot {
    pub clients: Vec<ClientActivity>,
    pub total: usize,
}

struct ActivityRecord {
    count: u64,
    last_seen: DateTime<Utc>,
    touched: Instant,
}

struct LocalWindow {
    count: u64,
    closes_at: Instant,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN)
}

/// Bounded, self-expiring per-client request counts.
///
/// Records live in an LRU ordered by last request, so the entries past the
/// retention age always sit at the cold end and are dropped from there on
/// every access. The same structure keeps the per-process fixed-window
/// counters the admission controller falls back to when the shared store is
/// out of reach.
pub struct ClientActivityTracker {
    config: TrackerConfig,
    clients: Mutex<LruCache<String, ActivityRecord>>,
    windows: Mutex<LruCache<String, LocalWindow>>,
}

impl ClientActivityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            clients: Mutex::new(LruCache::new(capacity(config.max_clients))),
            windows: Mutex::new(LruCache::new(capacity(config.max_windows))),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock_clients(&self) -> Result<MutexGuard<'_, LruCache<String, ActivityRecord>>> {
        self.clients.lock().map_err(|_| {
            Error::runtime_with_context(
                "Client tracker lock poisoned",
                ErrorContext::new().with_source("activity_tracker"),
            )
        })
    }

    fn lock_windows(&self) -> Result<MutexGuard<'_, LruCache<String, LocalWindow>>> {
        self.windows.lock().map_err(|_| {
            Error::runtime_with_context(
                "Local window lock poisoned",
                ErrorContext::new().with_source("activity_tracker"),
            )
        })
    }

    fn purge_expired(&self, clients: &mut LruCache<String, ActivityRecord>, now: Instant) {
        while let Some((_, rec)) = clients.peek_lru() {
            if now.saturating_duration_since(rec.touched) <= self.config.retention {
                break;
            }
            clients.pop_lru();
        }
    }

    /// Count one request from `client_id`, returning its count in the current
    /// retention window.
    pub fn record_request(&self, client_id: &str) -> Result<u64> {
        let now = Instant::now();
        let mut clients = self.lock_clients()?;
        self.purge_expired(&mut clients, now);

        let last_seen = Utc::now();
        if let Some(rec) = clients.get_mut(client_id) {
            rec.count += 1;
            rec.last_seen = last_seen;
            rec.touched = now;
            return Ok(rec.count);
        }
        clients.put(
            client_id.to_string(),
            ActivityRecord {
                count: 1,
                last_seen,
                touched: now,
            },
        );
        Ok(1)
    }

    pub fn snapshot(&self) -> Result<ActivitySnapshot> {
        let now = Instant::now();
        let mut clients = self.lock_clients()?;
        self.purge_expired(&mut clients, now);

        let clients: Vec<ClientActivity> = clients
            .iter()
            .map(|(id, rec)| ClientActivity {
                client_id: id.clone(),
                count: rec.count,
                last_seen: rec.last_seen,
            })
            .collect();
        Ok(ActivitySnapshot {
            total: clients.len(),
            clients,
        })
    }

    /// Clients still inside the retention window.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        match self.lock_clients() {
            Ok(mut clients) => {
                self.purge_expired(&mut clients, now);
                clients.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-process fixed-window counter for `scope`. The window opens on the
    /// first call and is never extended; the call after it closes opens a new
    /// one with a count of 1.
    pub fn record_in_window(&self, scope: &str, window: Duration) -> Result<WindowCount> {
        let now = Instant::now();
        let mut windows = self.lock_windows()?;
        let (count, closes_at) = match windows.get_mut(scope) {
            Some(w) if now < w.closes_at => {
                w.count += 1;
                (w.count, w.closes_at)
            }
            _ => (1, now + window),
        };
        if count == 1 {
            windows.put(scope.to_string(), LocalWindow { count, closes_at });
        }
        Ok(WindowCount {
            count,
            remaining: closes_at.saturating_duration_since(now),
        })
    }
}

impl Default for ClientActivityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker(max: usize, retention_secs: u64) -> ClientActivityTracker {
        ClientActivityTracker::new(
            TrackerConfig::new()
                .with_max_clients(max)
                .with_retention(Duration::from_secs(retention_secs)),
        )
    }

    fn ids(snapshot: &ActivitySnapshot) -> Vec<&str> {
        snapshot.clients.iter().map(|c| c.client_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_record_counts_per_client() {
        let t = tracker(16, 60);
        assert_eq!(t.record_request("10.0.0.1").unwrap(), 1);
        assert_eq!(t.record_request("10.0.0.1").unwrap(), 2);
        assert_eq!(t.record_request("10.0.0.2").unwrap(), 1);

        let snap = t.snapshot().unwrap();
        assert_eq!(snap.total, 2);
        assert_eq!(ids(&snap), vec!["10.0.0.2", "10.0.0.1"]);
        assert_eq!(snap.clients[1].count, 2);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_seen() {
        let t = tracker(2, 60);
        t.record_request("a").unwrap();
        t.record_request("b").unwrap();
        // touching a makes b the coldest
        t.record_request("a").unwrap();
        t.record_request("c").unwrap();

        let snap = t.snapshot().unwrap();
        assert_eq!(snap.total, 2);
        assert_eq!(ids(&snap), vec!["c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_records_never_returned() {
        let t = tracker(16, 10);
        t.record_request("old").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        t.record_request("fresh").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let snap = t.snapshot().unwrap();
        assert_eq!(ids(&snap), vec!["fresh"]);

        // a returning client starts a new count
        assert_eq!(t.record_request("old").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_len_agrees_with_snapshot_after_expiry() {
        let t = tracker(16, 10);
        t.record_request("a").unwrap();
        t.record_request("b").unwrap();
        assert_eq!(t.len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(t.len(), 0);
        assert!(t.is_empty());
        assert_eq!(t.snapshot().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_concurrent_records_are_not_lost() {
        let t = Arc::new(tracker(16, 60));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    t.record_request("shared").unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(t.snapshot().unwrap().clients[0].count, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_window_is_fixed() {
        let t = ClientActivityTracker::default();
        let window = Duration::from_secs(10);

        let first = t.record_in_window("rate-limit:/x:a", window).unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.remaining, window);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = t.record_in_window("rate-limit:/x:a", window).unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.remaining, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        let reopened = t.record_in_window("rate-limit:/x:a", window).unwrap();
        assert_eq!(reopened.count, 1);
        assert_eq!(reopened.remaining, window);
    }
}
