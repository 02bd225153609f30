//! 准入控制模块：基于固定窗口配额的请求准入与重试提示。
//!
//! # Admission Control Module
//!
//! Decides whether an inbound request proceeds under a quota of "at most N
//! requests per M seconds", scoped per client or per route. Counters live in
//! the shared store so every process in the deployment sees the same window;
//! when the store is unreachable, decisions degrade to per-process counts
//! rather than failing the request.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`AdmissionController`] | Fixed-window check with local fallback |
//! | [`AdmissionDecision`] | Accept, or reject with a retry hint |
//! | [`QuotaTable`] | Route to quota mapping, parsed from config |
//! | [`Quota`] / [`QuotaScope`] | `N/M` and who shares the counter |
//!
//! ## Example
//!
//! ```rust
//! use ai_governor::admission::{AdmissionController, QuotaTable};
//! use ai_governor::cache::{MemoryBackend, SharedCache, SharedCacheConfig};
//! use ai_governor::tracker::ClientActivityTracker;
//! use std::sync::Arc;
//!
//! # async fn demo() -> ai_governor::Result<()> {
//! let cache = Arc::new(SharedCache::new(Arc::new(MemoryBackend::new()), SharedCacheConfig::default()));
//! let admission = AdmissionController::new(
//!     cache,
//!     Arc::new(ClientActivityTracker::default()),
//!     QuotaTable::parse_list("/cache/flush=1/10")?,
//! );
//! assert!(admission.admit("203.0.113.9", "/cache/flush").await?.allowed);
//! let second = admission.admit("203.0.113.9", "/cache/flush").await?;
//! assert!(!second.allowed);
//! assert!(second.retry_after_secs.unwrap() <= 10);
//! # Ok(())
//! # }
//! ```

mod controller;
mod quota;

pub use controller::{retry_after_secs, AdmissionController, AdmissionDecision};
pub use quota::{Quota, QuotaScope, QuotaTable, RouteQuota, RATE_LIMIT_PREFIX};
