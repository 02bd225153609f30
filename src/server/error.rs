use crate::Error;
use axum::extract::rejection::JsonRejection;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// HTTP face of [`Error`], with OpenAI-style bodies.
#[derive(Debug)]
pub enum ApiError {
    Governor(Error),
    Forbidden(String),
    /// Request body the extractor could not accept.
    Rejected(StatusCode, String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Governor(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Rejected(status, _) => *status,
            ApiError::Governor(e) => match e {
                Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                Error::CacheUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                Error::Validation { .. } => StatusCode::BAD_REQUEST,
                Error::Downstream { .. }
                | Error::Configuration { .. }
                | Error::Runtime { .. }
                | Error::Io(_)
                | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Forbidden(_) | ApiError::Rejected(..) => "invalid_request_error",
            ApiError::Governor(Error::QuotaExceeded { .. }) => "rate_limit_exceeded",
            ApiError::Governor(Error::CacheUnavailable { .. }) => "service_unavailable",
            ApiError::Governor(Error::Validation { .. }) => "invalid_request_error",
            ApiError::Governor(_) => "server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let (message, retry_after) = match self {
            ApiError::Forbidden(msg) | ApiError::Rejected(_, msg) => (msg, None),
            ApiError::Governor(e) => (e.to_string(), e.retry_after_secs()),
        };
        let mut resp = (
            status,
            Json(json!({ "error": { "message": message, "type": kind } })),
        )
            .into_response();
        if let Some(secs) = retry_after {
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}
