//! 应答服务模块：下游应答契约、HTTP 实现与受治理的组合。
//!
//! # Answering Module
//!
//! The downstream answering service is opaque to the governance core: given a
//! query it returns an answer or fails. This module defines that contract and
//! the composition that puts it behind the shared answer cache and the
//! concurrency gate.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`AnswerService`] | `answer(query) -> text` contract |
//! | [`HttpAnswerService`] | OpenAI-compatible chat completions client |
//! | [`GovernedAnswerer`] | Cache lookup, gated downstream call, write-back |
//!
//! Failures from the downstream service surface as [`crate::Error::Downstream`]
//! and are never retried here.

mod governed;
mod http;

pub use governed::GovernedAnswerer;
pub use http::{HttpAnswerConfig, HttpAnswerService};

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait AnswerService: Send + Sync {
    async fn answer(&self, query: &str) -> Result<String>;

    fn name(&self) -> &str {
        "answer"
    }
}
