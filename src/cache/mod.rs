//! 共享缓存模块：基于外部键值存储的跨进程缓存与命中计数。
//!
//! # Shared Cache Module
//!
//! A process-wide client over an external key-value store (Redis in
//! production, an in-process store for tests and local runs), shared by every
//! service instance in the deployment.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`SharedCache`] | Lazily connected client with per-operation timeouts |
//! | [`KvBackend`] | Store operations, each atomic on the store side |
//! | [`Connector`] | Opens a backend; used once per connect attempt |
//! | [`RedisBackend`] | Redis implementation using server-side Lua scripts |
//! | [`MemoryBackend`] | In-process implementation with the same contract |
//! | [`AnswerKeyGenerator`] | Stable keys for cached downstream answers |
//!
//! ## Hit Tracking
//!
//! Every entry `<key>` may have a co-located counter `<key>:hits`. A tracked
//! read returns the value, increments the counter and re-applies the entry's
//! current expiry to both keys, all as one indivisible step, so concurrent
//! readers across processes never lose an increment and the counter never
//! outlives its entry.
//!
//! ```rust
//! use ai_governor::cache::{MemoryBackend, SharedCache, SharedCacheConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> ai_governor::Result<()> {
//! let cache = SharedCache::new(Arc::new(MemoryBackend::new()), SharedCacheConfig::default());
//! cache.store("answer:1", b"42", None).await?;
//! assert_eq!(cache.read_with_hit_tracking("answer:1").await?, Some(b"42".to_vec()));
//! assert_eq!(cache.hit_count("answer:1").await?, 1);
//! # Ok(())
//! # }
//! ```

mod backend;
mod key;
mod redis;
mod shared;

pub use backend::{Connector, KvBackend, MemoryBackend, WindowCount};
pub use key::{hits_key, is_hits_key, AnswerKeyGenerator, ANSWER_PREFIX, HITS_SUFFIX};
pub use self::redis::{RedisBackend, RedisConnector, FIXED_WINDOW_SCRIPT, READ_WITH_HITS_SCRIPT};
pub use shared::{
    CacheListing, CacheStats, ListedEntry, PatternDeletion, SharedCache, SharedCacheConfig,
    PREVIEW_CHARS,
};
