use super::error::ApiError;
use super::state::AppState;
use crate::cache::CacheListing;
use crate::{Error, ErrorContext};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// The subset of an OpenAI chat request this service reads.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
pub struct ClientStats {
    pub ip: String,
    pub requests: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub ips: Vec<ClientStats>,
    pub users: usize,
    pub cache: crate::cache::CacheStats,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let cache = if state.cache.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({ "status": "ok", "cache": cache }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.model,
            "object": "model",
            "created": Utc::now().timestamp(),
            "owned_by": "ai-governor",
        }],
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(ref expected) = state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Invalid API key".to_string()))
    }
}

fn approx_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let Json(req) = payload?;
    let query = req
        .messages
        .first()
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            Error::validation_with_context(
                "request must carry at least one non-empty message",
                ErrorContext::new().with_field_path("messages"),
            )
        })?;

    let answer = state.answerer.answer(query).await?;

    let prompt_tokens = approx_tokens(query);
    let completion_tokens = approx_tokens(&answer);
    Ok(Json(json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": req.model.unwrap_or_else(|| state.model.clone()),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": answer },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })))
}

pub async fn list_cache(State(state): State<AppState>) -> Result<Json<CacheListing>, ApiError> {
    Ok(Json(state.cache.list_all().await?))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.cache.delete_by_key(&q.key).await?;
    Ok(Json(json!({ "status": "ok", "deleted_count": deleted })))
}

pub async fn delete_pattern(
    State(state): State<AppState>,
    Query(q): Query<PatternQuery>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.cache.delete_by_pattern(&q.pattern).await?;
    Ok(Json(json!({
        "status": outcome.status(),
        "deleted_count": outcome.deleted,
    })))
}

pub async fn flush_cache(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.cache.flush_all().await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn server_stats(State(state): State<AppState>) -> Result<Json<ServerStats>, ApiError> {
    let snapshot = state.tracker().snapshot()?;
    Ok(Json(ServerStats {
        users: snapshot.total,
        ips: snapshot
            .clients
            .into_iter()
            .map(|c| ClientStats {
                ip: c.client_id,
                requests: c.count,
                last_seen: c.last_seen,
            })
            .collect(),
        cache: state.cache.stats(),
    }))
}
