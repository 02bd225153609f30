//! 客户端活动跟踪模块：有界、自过期的每客户端请求计数。
//!
//! # Client Activity Module
//!
//! Keeps a per-process view of who is sending traffic, bounded both by the
//! number of distinct clients and by age since each client's last request.
//! It backs the `/server/stats` view and is the source of truth for admission
//! decisions while the shared store is unreachable.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ClientActivityTracker`] | LRU- and age-bounded request counts |
//! | [`TrackerConfig`] | Size and retention bounds |
//! | [`client_id`] | Identity from a forwarded header or the peer address |
//!
//! ## Example
//!
//! ```rust
//! use ai_governor::tracker::{ClientActivityTracker, TrackerConfig};
//! use std::time::Duration;
//!
//! let tracker = ClientActivityTracker::new(
//!     TrackerConfig::new()
//!         .with_max_clients(2048)
//!         .with_retention(Duration::from_secs(3600)),
//! );
//! tracker.record_request("203.0.113.9").unwrap();
//! assert_eq!(tracker.snapshot().unwrap().total, 1);
//! ```

mod activity;
mod identity;

pub use activity::{ActivitySnapshot, ClientActivity, ClientActivityTracker, TrackerConfig};
pub use identity::{client_id, UNKNOWN_CLIENT};
