use ai_governor::admission::{AdmissionController, Quota, QuotaScope, QuotaTable, RouteQuota};
use ai_governor::cache::{MemoryBackend, SharedCache, SharedCacheConfig};
use ai_governor::tracker::ClientActivityTracker;
use std::sync::Arc;
use std::time::Duration;

const ROUTE: &str = "/cache/key";

fn one_per_ten() -> QuotaTable {
    QuotaTable::empty().with_route(
        ROUTE,
        RouteQuota::new(Quota::per_secs(1, 10), QuotaScope::Client),
    )
}

fn controller(backend: &MemoryBackend) -> AdmissionController {
    let cache = Arc::new(SharedCache::new(
        Arc::new(backend.clone()),
        SharedCacheConfig::default(),
    ));
    AdmissionController::new(cache, Arc::new(ClientActivityTracker::default()), one_per_ten())
}

#[tokio::test(start_paused = true)]
async fn test_second_request_in_window_is_rejected() {
    let backend = MemoryBackend::new();
    let admission = controller(&backend);

    assert!(admission.admit("203.0.113.9", ROUTE).await.unwrap().allowed);

    tokio::time::advance(Duration::from_millis(2500)).await;
    let second = admission.admit("203.0.113.9", ROUTE).await.unwrap();
    assert!(!second.allowed);
    assert!(!second.local_fallback);
    let retry = second.retry_after_secs.unwrap();
    assert!(retry > 0 && retry <= 10);
    assert_eq!(retry, 8);

    // other clients have their own window
    assert!(admission.admit("198.51.100.4", ROUTE).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_window_does_not_slide() {
    let backend = MemoryBackend::new();
    let admission = controller(&backend);

    admission.admit("a", ROUTE).await.unwrap();
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!admission.admit("a", ROUTE).await.unwrap().allowed);
    }
    // rejected attempts did not push the boundary past t=10s
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert!(admission.admit("a", ROUTE).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_new_window_resets_counter() {
    let backend = MemoryBackend::new();
    let admission = controller(&backend);

    admission.admit("a", ROUTE).await.unwrap();
    assert!(!admission.admit("a", ROUTE).await.unwrap().allowed);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(admission.admit("a", ROUTE).await.unwrap().allowed);
    assert_eq!(
        backend.ttl_of("rate-limit:/cache/key:a"),
        Some(Duration::from_secs(10))
    );
    // counter restarted at 1, so the next one is over quota again
    assert!(!admission.admit("a", ROUTE).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_quota_is_shared_across_processes() {
    let backend = MemoryBackend::new();
    let first = controller(&backend);
    let second = controller(&backend);

    assert!(first.admit("a", ROUTE).await.unwrap().allowed);
    assert!(!second.admit("a", ROUTE).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_falls_back_to_local_counts() {
    let backend = MemoryBackend::new();
    backend.set_offline(true);
    let admission = controller(&backend);

    let first = admission.admit("a", ROUTE).await.unwrap();
    assert!(first.allowed);
    assert!(first.local_fallback);

    let second = admission.admit("a", ROUTE).await.unwrap();
    assert!(!second.allowed);
    assert!(second.local_fallback);
    assert_eq!(second.retry_after_secs, Some(10));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(admission.admit("a", ROUTE).await.unwrap().allowed);

    let stats = admission.tracker().snapshot().unwrap();
    assert_eq!(stats.clients[0].count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_outage_mid_window_keeps_admitting() {
    let backend = MemoryBackend::new();
    let admission = controller(&backend);
    assert!(admission.admit("a", ROUTE).await.unwrap().allowed);

    // the local window starts empty: an outage admits up to N again per process
    backend.set_offline(true);
    let during = admission.admit("a", ROUTE).await.unwrap();
    assert!(during.allowed);
    assert!(during.local_fallback);
    assert!(!admission.admit("a", ROUTE).await.unwrap().allowed);
}
