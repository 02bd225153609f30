use crate::{Error, ErrorContext, Result};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ReconnectBreakerSnapshot {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReconnectBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for ReconnectBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            cooldown: Duration::from_secs(5),
        }
    }
}

impl ReconnectBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct State {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Guards connection attempts to the shared store.
///
/// - Counts consecutive failed connects
/// - After the threshold, refuses attempts for a cooldown so an unreachable
///   store does not cost every request a full connect timeout
pub struct ReconnectBreaker {
    cfg: ReconnectBreakerConfig,
    state: std::sync::Mutex<State>,
}

impl ReconnectBreaker {
    pub fn new(cfg: ReconnectBreakerConfig) -> Self {
        Self {
            cfg,
            state: std::sync::Mutex::new(State {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    pub fn allow(&self) -> Result<()> {
        let mut st = self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "ReconnectBreaker poisoned",
                ErrorContext::new().with_source("reconnect_breaker"),
            )
        })?;
        if let Some(until) = st.open_until {
            let now = Instant::now();
            if now < until {
                return Err(Error::cache_unavailable_with_context(
                    "reconnect cooling down",
                    ErrorContext::new()
                        .with_source("reconnect_breaker")
                        .with_details(format!("{}ms left", (until - now).as_millis())),
                ));
            }
            // cooldown expired, allow one more round of attempts
            st.open_until = None;
            st.consecutive_failures = 0;
        }
        Ok(())
    }

    pub fn on_success(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.consecutive_failures = 0;
            st.open_until = None;
        }
    }

    pub fn on_failure(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            if st.consecutive_failures >= self.cfg.failure_threshold {
                st.open_until = Some(Instant::now() + self.cfg.cooldown);
            }
        }
    }

    pub fn snapshot(&self) -> ReconnectBreakerSnapshot {
        let now = Instant::now();
        let (consecutive_failures, open_remaining_ms) = match self.state.lock() {
            Ok(st) => (
                st.consecutive_failures,
                st.open_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_millis() as u64),
            ),
            Err(_) => (0, None),
        };
        ReconnectBreakerSnapshot {
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures,
            open_remaining_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ReconnectBreakerConfig::default();
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.cooldown, Duration::from_secs(5));
    }

    #[test]
    fn test_threshold_is_at_least_one() {
        let config = ReconnectBreakerConfig::new().with_failure_threshold(0);
        assert_eq!(config.failure_threshold, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let breaker = ReconnectBreaker::new(
            ReconnectBreakerConfig::new().with_failure_threshold(5),
        );
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.snapshot().consecutive_failures, 2);

        breaker.on_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_and_cools_down() {
        let breaker = ReconnectBreaker::new(
            ReconnectBreakerConfig::new()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_millis(500)),
        );
        breaker.on_failure();
        assert!(breaker.allow().is_ok());

        breaker.on_failure();
        let err = breaker.allow().unwrap_err();
        assert!(err.is_cache_unavailable());
        assert!(breaker.snapshot().open_remaining_ms.is_some());

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }
}
