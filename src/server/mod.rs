//! HTTP 服务模块：OpenAI 兼容接口、缓存管理接口与统计视图。
//!
//! # HTTP Surface
//!
//! An axum router exposing the governed answering path and the cache
//! administration routes. Every request passes through
//! [`governance_middleware`], which identifies the client, records it in the
//! activity tracker and applies the route's quota before the handler runs.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/`, `/health` | GET | liveness and cache connectivity |
//! | `/v1/models` | GET | the single served model |
//! | `/v1/chat/completions` | POST | governed answer for the first message |
//! | `/cache/all` | GET | keys with value preview and TTL |
//! | `/cache/key?key=` | DELETE | delete one key |
//! | `/cache/pattern?pattern=` | DELETE | delete keys matching a glob |
//! | `/cache/flush` | DELETE | wipe the store |
//! | `/server/stats` | GET | per-client request counts |

mod error;
mod handlers;
mod middleware;
mod state;

pub use error::ApiError;
pub use handlers::{ChatCompletionRequest, ClientStats, ServerStats};
pub use middleware::{governance_middleware, FORWARDED_FOR};
pub use state::AppState;

use axum::routing::{delete, get, post};
use axum::Router;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/cache/all", get(handlers::list_cache))
        .route("/cache/key", delete(handlers::delete_key))
        .route("/cache/pattern", delete(handlers::delete_pattern))
        .route("/cache/flush", delete(handlers::flush_cache))
        .route("/server/stats", get(handlers::server_stats))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            governance_middleware,
        ))
        .with_state(state)
}
