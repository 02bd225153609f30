//! Runtime configuration.
//!
//! Settings come from an optional YAML file named by `AI_GOVERNOR_CONFIG`,
//! then `AI_GOVERNOR_*` environment variables override individual fields.
//! Missing required settings and out-of-range values are reported as
//! [`Error::Configuration`], which must stop the process before it accepts
//! traffic.

use crate::admission::QuotaTable;
use crate::answer::HttpAnswerConfig;
use crate::cache::{AnswerKeyGenerator, RedisConnector, SharedCacheConfig};
use crate::resilience::{window_duration, ConcurrencyGate, MAX_GATE_PERMITS};
use crate::tracker::TrackerConfig;
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "AI_GOVERNOR_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub host: Option<String>,
    pub port: u16,
    pub db: i64,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    pub reconnect_cooldown_ms: u64,
    pub reconnect_failures: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 6379,
            db: 0,
            connect_timeout_ms: 20_000,
            op_timeout_ms: 20_000,
            reconnect_cooldown_ms: 5_000,
            reconnect_failures: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub max_clients: usize,
    pub retention_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_clients: 2048,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub max_concurrent: usize,
    pub window_secs: f64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            window_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    /// Bearer key sent to the downstream service.
    pub api_key: Option<String>,
    /// Mixed into answer cache keys; changing it orphans earlier answers.
    pub cache_salt: Option<String>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            model: "ai-governor".to_string(),
            timeout_secs: 120,
            api_key: None,
            cache_salt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub http_port: u16,
    pub store: StoreSettings,
    pub default_ttl_secs: u64,
    pub tracker: TrackerSettings,
    pub quotas: QuotaTable,
    pub gate: GateSettings,
    pub upstream: UpstreamSettings,
    /// Bearer key required on the chat route; auth is off when unset.
    pub api_key: Option<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            http_port: 9443,
            store: StoreSettings::default(),
            default_ttl_secs: 3600,
            tracker: TrackerSettings::default(),
            quotas: QuotaTable::default(),
            gate: GateSettings::default(),
            upstream: UpstreamSettings::default(),
            api_key: None,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::configuration_with_context(
            format!("invalid value for {}", key),
            ErrorContext::new()
                .with_field_path(key)
                .with_details(raw.to_string()),
        )
    })
}

fn missing(field: &str, env: &str) -> Error {
    Error::configuration_with_context(
        format!("{} is required", field),
        ErrorContext::new()
            .with_field_path(field)
            .with_details(format!("set {}", env)),
    )
}

fn out_of_range(field: &str, details: &str) -> Error {
    Error::configuration_with_context(
        format!("{} is out of range", field),
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details.to_string()),
    )
}

impl GovernorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                "invalid config file",
                ErrorContext::new()
                    .with_source("yaml")
                    .with_details(e.to_string()),
            )
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file {}", path.display()),
                ErrorContext::new().with_details(e.to_string()),
            )
        })?;
        Self::from_yaml_str(&raw)
    }

    /// File (if named), then process environment. Not validated.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AI_GOVERNOR_HTTP_PORT") {
            self.http_port = parse_value("AI_GOVERNOR_HTTP_PORT", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_SERVER") {
            self.store.host = Some(v.trim().to_string());
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_PORT") {
            self.store.port = parse_value("AI_GOVERNOR_REDIS_PORT", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_DB") {
            self.store.db = parse_value("AI_GOVERNOR_REDIS_DB", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_CONNECT_TIMEOUT_MS") {
            self.store.connect_timeout_ms = parse_value("AI_GOVERNOR_REDIS_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_OP_TIMEOUT_MS") {
            self.store.op_timeout_ms = parse_value("AI_GOVERNOR_REDIS_OP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_RECONNECT_COOLDOWN_MS") {
            self.store.reconnect_cooldown_ms =
                parse_value("AI_GOVERNOR_REDIS_RECONNECT_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_REDIS_RECONNECT_FAILURES") {
            self.store.reconnect_failures =
                parse_value("AI_GOVERNOR_REDIS_RECONNECT_FAILURES", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_DEFAULT_TTL_SECS") {
            self.default_ttl_secs = parse_value("AI_GOVERNOR_DEFAULT_TTL_SECS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_MAX_TRACKED_CLIENTS") {
            self.tracker.max_clients = parse_value("AI_GOVERNOR_MAX_TRACKED_CLIENTS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_TRACKER_RETENTION_SECS") {
            self.tracker.retention_secs = parse_value("AI_GOVERNOR_TRACKER_RETENTION_SECS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_ROUTE_QUOTAS") {
            self.quotas = QuotaTable::parse_list(&v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_MAX_CONCURRENT") {
            self.gate.max_concurrent = parse_value("AI_GOVERNOR_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_WINDOW_SECS") {
            self.gate.window_secs = parse_value("AI_GOVERNOR_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_UPSTREAM_URL") {
            self.upstream.url = Some(v.trim().to_string());
        }
        if let Some(v) = get("AI_GOVERNOR_UPSTREAM_MODEL") {
            self.upstream.model = v.trim().to_string();
        }
        if let Some(v) = get("AI_GOVERNOR_UPSTREAM_TIMEOUT_SECS") {
            self.upstream.timeout_secs = parse_value("AI_GOVERNOR_UPSTREAM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AI_GOVERNOR_UPSTREAM_API_KEY") {
            self.upstream.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = get("AI_GOVERNOR_ANSWER_CACHE_SALT") {
            self.upstream.cache_salt = Some(v.trim().to_string());
        }
        if let Some(v) = get("AI_GOVERNOR_API_KEY") {
            self.api_key = Some(v.trim().to_string());
        }
        Ok(())
    }

    /// Port from the first command line argument, if given.
    pub fn with_port_arg(mut self, arg: Option<&str>) -> Result<Self> {
        if let Some(arg) = arg {
            self.http_port = parse_value("http_port", arg)?;
        }
        Ok(self)
    }

    /// Checks needed by every component.
    pub fn validate(&self) -> Result<()> {
        if self.store.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
            return Err(missing("store.host", "AI_GOVERNOR_REDIS_SERVER"));
        }
        if self.default_ttl_secs == 0 {
            return Err(out_of_range("default_ttl_secs", "must be positive"));
        }
        if self.store.connect_timeout_ms == 0 || self.store.op_timeout_ms == 0 {
            return Err(out_of_range("store", "timeouts must be positive"));
        }
        if self.store.reconnect_failures == 0 {
            return Err(out_of_range("store.reconnect_failures", "must be positive"));
        }
        if self.tracker.max_clients == 0 {
            return Err(out_of_range("tracker.max_clients", "must be positive"));
        }
        if self.tracker.retention_secs == 0 {
            return Err(out_of_range("tracker.retention_secs", "must be positive"));
        }
        if self.gate.max_concurrent == 0 || self.gate.max_concurrent > MAX_GATE_PERMITS {
            return Err(out_of_range(
                "gate.max_concurrent",
                &format!("must be between 1 and {}", MAX_GATE_PERMITS),
            ));
        }
        window_duration(self.gate.window_secs)?;
        for (route, rq) in self.quotas.iter() {
            if rq.quota.limit == 0 || rq.quota.window.is_zero() {
                return Err(out_of_range("quotas", route));
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the settings only the server needs.
    pub fn validate_server(&self) -> Result<()> {
        self.validate()?;
        if self.upstream.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(missing("upstream.url", "AI_GOVERNOR_UPSTREAM_URL"));
        }
        Ok(())
    }

    pub fn connector(&self) -> Result<RedisConnector> {
        let host = self
            .store
            .host
            .as_deref()
            .ok_or_else(|| missing("store.host", "AI_GOVERNOR_REDIS_SERVER"))?;
        Ok(RedisConnector::new(host, self.store.port, self.store.db))
    }

    pub fn shared_cache_config(&self) -> SharedCacheConfig {
        SharedCacheConfig::new()
            .with_default_ttl(Duration::from_secs(self.default_ttl_secs))
            .with_connect_timeout(Duration::from_millis(self.store.connect_timeout_ms))
            .with_op_timeout(Duration::from_millis(self.store.op_timeout_ms))
            .with_reconnect_cooldown(Duration::from_millis(self.store.reconnect_cooldown_ms))
            .with_reconnect_failures(self.store.reconnect_failures)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig::new()
            .with_max_clients(self.tracker.max_clients)
            .with_retention(Duration::from_secs(self.tracker.retention_secs))
            .with_max_windows(self.tracker.max_clients.saturating_mul(2))
    }

    pub fn gate(&self) -> Result<ConcurrencyGate> {
        ConcurrencyGate::from_secs_f64(self.gate.max_concurrent, self.gate.window_secs)
    }

    /// Answer cache keys scoped to the upstream model and optional salt.
    pub fn answer_keys(&self) -> AnswerKeyGenerator {
        let keys = AnswerKeyGenerator::new().with_model(self.upstream.model.clone());
        match self.upstream.cache_salt.as_deref() {
            Some(salt) if !salt.is_empty() => keys.with_salt(salt),
            _ => keys,
        }
    }

    pub fn http_answer_config(&self) -> Result<HttpAnswerConfig> {
        let url = self
            .upstream
            .url
            .as_deref()
            .ok_or_else(|| missing("upstream.url", "AI_GOVERNOR_UPSTREAM_URL"))?;
        let mut config = HttpAnswerConfig::new(url)
            .with_model(self.upstream.model.clone())
            .with_timeout(Duration::from_secs(self.upstream.timeout_secs));
        if let Some(ref key) = self.upstream.api_key {
            config = config.with_api_key(key.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Quota, QuotaScope};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GovernorConfig::default();
        assert_eq!(config.http_port, 9443);
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.default_ttl_secs, 3600);
        assert_eq!(config.tracker.max_clients, 2048);
        assert_eq!(config.gate.max_concurrent, 4);
        assert_eq!(config.upstream.model, "ai-governor");
    }

    #[test]
    fn test_missing_store_host_is_fatal() {
        let err = GovernorConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("store.host")
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GovernorConfig::default();
        config
            .apply_env_with(env(&[
                ("AI_GOVERNOR_REDIS_SERVER", "cache.internal"),
                ("AI_GOVERNOR_REDIS_PORT", "6380"),
                ("AI_GOVERNOR_MAX_CONCURRENT", "8"),
                ("AI_GOVERNOR_WINDOW_SECS", "2.5"),
                ("AI_GOVERNOR_ROUTE_QUOTAS", "/v1/chat/completions=3/30:route"),
                ("AI_GOVERNOR_UPSTREAM_URL", "http://llm:8000"),
                ("AI_GOVERNOR_API_KEY", ""),
            ]))
            .unwrap();
        assert_eq!(config.store.host.as_deref(), Some("cache.internal"));
        assert_eq!(config.store.port, 6380);
        assert_eq!(config.gate.max_concurrent, 8);
        assert_eq!(config.gate().unwrap().pacing_interval(), Duration::from_micros(312_500));
        assert_eq!(
            config.quotas.get("/v1/chat/completions").map(|rq| (rq.quota, rq.scope)),
            Some((Quota::per_secs(3, 30), QuotaScope::Route))
        );
        // empty values leave the default in place
        assert!(config.api_key.is_none());
        config.validate_server().unwrap();
        assert_eq!(config.connector().unwrap().url(), "redis://cache.internal:6380/0");
    }

    #[test]
    fn test_reconnect_and_salt_settings() {
        let mut config = GovernorConfig::default();
        config
            .apply_env_with(env(&[
                ("AI_GOVERNOR_REDIS_SERVER", "cache.internal"),
                ("AI_GOVERNOR_REDIS_RECONNECT_FAILURES", "3"),
                ("AI_GOVERNOR_ANSWER_CACHE_SALT", "corpus-v2"),
            ]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.shared_cache_config().reconnect_failures, 3);

        let salted = config.answer_keys().generate("what is the UPF?");
        config.upstream.cache_salt = None;
        let unsalted = config.answer_keys().generate("what is the UPF?");
        assert_ne!(salted, unsalted);
        assert_eq!(
            unsalted,
            AnswerKeyGenerator::new()
                .with_model("ai-governor")
                .generate("what is the UPF?")
        );

        config.store.reconnect_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparsable_env_value() {
        let mut config = GovernorConfig::default();
        let err = config
            .apply_env_with(env(&[("AI_GOVERNOR_REDIS_PORT", "sixty")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = GovernorConfig::default();
        config.store.host = Some("localhost".into());
        config.gate.max_concurrent = 0;
        assert!(config.validate().is_err());

        config.gate.max_concurrent = 2;
        config.gate.window_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gate_bounds_rejected_before_building() {
        let mut config = GovernorConfig::default();
        config.store.host = Some("h".into());
        config.gate.max_concurrent = 1usize << 32;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("gate.max_concurrent")
        );
        assert!(matches!(config.gate(), Err(Error::Configuration { .. })));

        config.gate.max_concurrent = 4;
        config.gate.window_secs = 1e30;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("gate.window_secs")
        );
        assert!(matches!(config.gate(), Err(Error::Configuration { .. })));

        config.gate.window_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_requires_upstream() {
        let mut config = GovernorConfig::default();
        config.store.host = Some("localhost".into());
        config.validate().unwrap();
        assert!(config.validate_server().is_err());
    }

    #[test]
    fn test_yaml_file_shape() {
        let yaml = r#"
http_port: 8080
store:
  host: redis.internal
  db: 2
default_ttl_secs: 600
quotas:
  /v1/chat/completions: "20/60"
gate:
  max_concurrent: 2
  window_secs: 4
"#;
        let config = GovernorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.store.db, 2);
        assert_eq!(config.quotas.len(), 1);
        assert_eq!(config.gate().unwrap().pacing_interval(), Duration::from_secs(2));
        assert_eq!(config.shared_cache_config().default_ttl, Duration::from_secs(600));
        config.validate().unwrap();
    }

    #[test]
    fn test_port_arg() {
        let config = GovernorConfig::default().with_port_arg(Some("7000")).unwrap();
        assert_eq!(config.http_port, 7000);
        assert!(GovernorConfig::default().with_port_arg(Some("x")).is_err());
    }
}
