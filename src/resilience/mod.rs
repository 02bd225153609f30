//! 弹性模式模块：并发闸门与存储重连熔断。
//!
//! # Resilience Primitives Module
//!
//! This module protects scarce resources on both sides of the service: the
//! downstream answering service, which cannot absorb unbounded concurrent load,
//! and the shared store, whose outages must not cost every request a connect
//! timeout.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`gate`] | Bounded-concurrency runner with completion pacing |
//! | [`breaker`] | Connect-attempt breaker used by the shared cache |
//!
//! ## Concurrency Gate
//!
//! Permits are held for the task *and* a pacing pause of
//! `window / max_concurrent`, so completion rate stays bounded even when tasks
//! finish instantly or fail fast:
//!
//! ```rust
//! use ai_governor::resilience::gate::ConcurrencyGate;
//! use std::time::Duration;
//!
//! # async fn demo() -> ai_governor::Result<()> {
//! let gate = ConcurrencyGate::new(4, Duration::from_secs(2)); // 500ms pacing
//! let answer = gate.run(|| async { "42".to_string() }).await?;
//! assert_eq!(answer, "42");
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod gate;

pub use breaker::{ReconnectBreaker, ReconnectBreakerConfig, ReconnectBreakerSnapshot};
pub use gate::{window_duration, ConcurrencyGate, GateSnapshot, MAX_GATE_PERMITS, MAX_GATE_WINDOW};
