//! # ai-governor
//!
//! 面向 AI 问答服务的请求治理与共享缓存核心：准入控制、并发限流与跨进程命中计数缓存。
//!
//! Request governance and caching core for an AI-assisted query service.
//!
//! ## Overview
//!
//! The crate fronts an expensive downstream answering service with two
//! coupled responsibilities:
//!
//! - **Admission and pacing**: fixed-window quotas per client or per route,
//!   shared by every process through one external store, and a concurrency
//!   gate that bounds in-flight downstream calls and paces their completions.
//! - **Shared caching**: a hit-counted, TTL-refreshing cache on the same
//!   store, used to reuse answers across processes.
//!
//! When the store is unreachable, reads become misses and admission falls
//! back to per-process counts; nothing in the request path fails because of
//! the store alone.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_governor::admission::AdmissionController;
//! use ai_governor::cache::SharedCache;
//! use ai_governor::config::GovernorConfig;
//! use ai_governor::tracker::ClientActivityTracker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ai_governor::Result<()> {
//!     let config = GovernorConfig::load()?;
//!     config.validate()?;
//!
//!     let cache = Arc::new(SharedCache::new(
//!         Arc::new(config.connector()?),
//!         config.shared_cache_config(),
//!     ));
//!     cache.connect().await;
//!
//!     let admission = AdmissionController::new(
//!         cache.clone(),
//!         Arc::new(ClientActivityTracker::new(config.tracker_config())),
//!         config.quotas.clone(),
//!     );
//!     let decision = admission.admit("203.0.113.9", "/v1/chat/completions").await?;
//!     println!("allowed: {}", decision.allowed);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Shared store client, backends and key helpers |
//! | [`resilience`] | Concurrency gate and store reconnect breaker |
//! | [`tracker`] | Per-client activity and local quota windows |
//! | [`admission`] | Fixed-window quotas and admission decisions |
//! | [`answer`] | Downstream answer contract and governed composition |
//! | [`config`] | File and environment configuration |
//! | [`server`] | axum HTTP surface |

pub mod admission;
pub mod answer;
pub mod cache;
pub mod config;
pub mod resilience;
pub mod server;
pub mod tracker;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

pub mod error;
pub use error::{Error, ErrorContext};
