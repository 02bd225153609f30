use super::error::ApiError;
use super::state::AppState;
use crate::tracker::client_id;
use crate::Error;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identify the client, apply the route quota, and log the exchange.
///
/// Every request is counted for the client before the quota check, so stats
/// include rejected traffic.
pub async fn governance_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let client = {
        let forwarded = request
            .headers()
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok());
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        client_id(forwarded, peer)
    };
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let decision = state.admission.admit(&client, &path).await?;
    if !decision.allowed {
        let retry_after = decision.retry_after_secs.unwrap_or(1);
        debug!(
            target: "access",
            method = %method,
            path = %path,
            status = 429u16,
            client = %client,
            local = decision.local_fallback,
            "rejected"
        );
        return Err(Error::quota_exceeded(format!("{}:{}", path, client), retry_after).into());
    }

    let response = next.run(request).await;
    debug!(
        target: "access",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        client = %client,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "served"
    );
    Ok(response)
}
