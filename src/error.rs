use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Configuration key or cache key the error relates to (e.g., "store.host", "answer:ab12..")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected format, actual value)
    pub details: Option<String>,
    /// Component that produced the error (e.g., "shared_cache", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the governance core.
///
/// Transport-level failures from the store, the downstream service and the
/// runtime are folded into these categories at each component boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared store is down, timed out, or was never reached.
    #[error("Cache unavailable: {message}{}", format_context(.context))]
    CacheUnavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("Too Many Requests. Retry after {retry_after_secs} seconds.")]
    QuotaExceeded {
        scope: String,
        retry_after_secs: u64,
    },

    #[error("Downstream answering service failed: {message}")]
    Downstream {
        message: String,
        status: Option<u16>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a cache-unavailable error tagged with the shared cache as source.
    pub fn cache_unavailable(msg: impl Into<String>) -> Self {
        Error::CacheUnavailable {
            message: msg.into(),
            context: ErrorContext::new().with_source("shared_cache"),
        }
    }

    pub fn cache_unavailable_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::CacheUnavailable {
            message: msg.into(),
            context,
        }
    }

    pub fn quota_exceeded(scope: impl Into<String>, retry_after_secs: u64) -> Self {
        Error::QuotaExceeded {
            scope: scope.into(),
            retry_after_secs,
        }
    }

    pub fn downstream(msg: impl Into<String>, status: Option<u16>) -> Self {
        Error::Downstream {
            message: msg.into(),
            status,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Error::CacheUnavailable { .. })
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }

    /// Retry hint in seconds, present only for quota rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::QuotaExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::CacheUnavailable { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        let kind = format!("{:?}", e.kind());
        Error::cache_unavailable_with_context(
            e.to_string(),
            ErrorContext::new()
                .with_source("redis")
                .with_details(kind),
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::cache_unavailable("operation timed out")
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        let message = if e.is_timeout() {
            format!("request timed out: {}", e)
        } else {
            e.to_string()
        };
        Error::downstream(message, status)
    }
}
