use super::quota::{QuotaTable, RouteQuota};
use crate::cache::{SharedCache, WindowCount};
use crate::tracker::ClientActivityTracker;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one admission check. Produced per request, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Seconds until the window closes; only set on rejection.
    pub retry_after_secs: Option<u64>,
    /// Decided from per-process counts because the shared store was unreachable.
    pub local_fallback: bool,
}

impl AdmissionDecision {
    pub fn accepted() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
            local_fallback: false,
        }
    }

    pub fn rejected(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
            local_fallback: false,
        }
    }

    fn locally(mut self, local: bool) -> Self {
        self.local_fallback = local;
        self
    }

    /// `Err(Error::QuotaExceeded)` for a rejection.
    pub fn into_result(self, scope: &str) -> Result<()> {
        match self.retry_after_secs {
            Some(secs) if !self.allowed => Err(Error::quota_exceeded(scope, secs)),
            _ => Ok(()),
        }
    }
}

/// Whole seconds until the window closes, never below 1.
pub fn retry_after_secs(remaining_ms: u128) -> u64 {
    remaining_ms.div_ceil(1000).max(1) as u64
}

/// Fixed-window admission over the shared store.
///
/// The first request of a window creates the scope counter with an expiry of
/// the window length; later requests only increment it, so the window closes
/// at its original boundary. While the shared store is unreachable the same
/// quotas are enforced against per-process counters in the tracker. That
/// fallback under-counts when several processes serve the same clients: each
/// process admits up to N per window on its own.
pub struct AdmissionController {
    cache: Arc<SharedCache>,
    tracker: Arc<ClientActivityTracker>,
    quotas: QuotaTable,
}

impl AdmissionController {
    pub fn new(
        cache: Arc<SharedCache>,
        tracker: Arc<ClientActivityTracker>,
        quotas: QuotaTable,
    ) -> Self {
        Self {
            cache,
            tracker,
            quotas,
        }
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    pub fn tracker(&self) -> &Arc<ClientActivityTracker> {
        &self.tracker
    }

    /// Decide whether a request from `client` on `route` may proceed.
    ///
    /// Every attempt is recorded in the tracker, admitted or not.
    pub async fn admit(&self, client: &str, route: &str) -> Result<AdmissionDecision> {
        if let Err(e) = self.tracker.record_request(client) {
            warn!(client = %client, error = %e, "could not record client activity");
        }
        match self.quotas.get(route) {
            Some(rq) => self.admit_with(client, route, rq).await,
            None => Ok(AdmissionDecision::accepted()),
        }
    }

    /// [`admit`](Self::admit) as a `Result`, rejecting with
    /// [`Error::QuotaExceeded`].
    pub async fn check(&self, client: &str, route: &str) -> Result<()> {
        let decision = self.admit(client, route).await?;
        let scope = self
            .quotas
            .get(route)
            .map(|rq| rq.scope_key(route, client))
            .unwrap_or_else(|| route.to_string());
        decision.into_result(&scope)
    }

    async fn admit_with(
        &self,
        client: &str,
        route: &str,
        rq: &RouteQuota,
    ) -> Result<AdmissionDecision> {
        let key = rq.scope_key(route, client);
        let (window, local) = match self.cache.increment_window(&key, rq.quota.window).await {
            Ok(window) => (window, false),
            Err(e) => {
                if e.is_cache_unavailable() {
                    debug!(scope = %key, error = %e, "shared store unavailable, admitting on local counts");
                } else {
                    warn!(scope = %key, error = %e, "shared counter failed, admitting on local counts");
                }
                (self.tracker.record_in_window(&key, rq.quota.window)?, true)
            }
        };
        Ok(self.decide(&key, rq, window).locally(local))
    }

    fn decide(&self, key: &str, rq: &RouteQuota, window: WindowCount) -> AdmissionDecision {
        if window.count <= rq.quota.limit {
            return AdmissionDecision::accepted();
        }
        let retry_after = retry_after_secs(window.remaining.as_millis());
        warn!(
            scope = %key,
            count = window.count,
            quota = %rq.quota,
            retry_after,
            "quota exceeded"
        );
        AdmissionDecision::rejected(retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Quota, QuotaScope};
    use crate::cache::{MemoryBackend, SharedCacheConfig};
    use std::time::Duration;

    fn controller(backend: &MemoryBackend, quotas: QuotaTable) -> AdmissionController {
        AdmissionController::new(
            Arc::new(SharedCache::new(
                Arc::new(backend.clone()),
                SharedCacheConfig::default(),
            )),
            Arc::new(ClientActivityTracker::default()),
            quotas,
        )
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(0), 1);
        assert_eq!(retry_after_secs(1), 1);
        assert_eq!(retry_after_secs(1000), 1);
        assert_eq!(retry_after_secs(1001), 2);
        assert_eq!(retry_after_secs(9_999), 10);
    }

    #[test]
    fn test_decision_into_result() {
        assert!(AdmissionDecision::accepted().into_result("s").is_ok());
        let err = AdmissionDecision::rejected(7).into_result("s").unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_unlimited_route_is_tracked_and_admitted() {
        let backend = MemoryBackend::new();
        let c = controller(&backend, QuotaTable::empty());
        for _ in 0..5 {
            assert!(c.admit("203.0.113.9", "/health").await.unwrap().allowed);
        }
        let snap = c.tracker().snapshot().unwrap();
        assert_eq!(snap.clients[0].count, 5);
    }

    #[tokio::test]
    async fn test_route_scope_is_shared_between_clients() {
        let backend = MemoryBackend::new();
        let quotas = QuotaTable::empty().with_route(
            "/cache/flush",
            RouteQuota::new(Quota::per_secs(1, 10), QuotaScope::Route),
        );
        let c = controller(&backend, quotas);
        assert!(c.admit("a", "/cache/flush").await.unwrap().allowed);
        assert!(!c.admit("b", "/cache/flush").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_tracked() {
        let backend = MemoryBackend::new();
        let quotas = QuotaTable::empty().with_route(
            "/cache/key",
            RouteQuota::new(Quota::per_secs(1, 10), QuotaScope::Client),
        );
        let c = controller(&backend, quotas);
        c.admit("a", "/cache/key").await.unwrap();
        let err = c.check("a", "/cache/key").await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(c.tracker().snapshot().unwrap().clients[0].count, 2);
    }
}
