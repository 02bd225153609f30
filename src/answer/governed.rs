use super::AnswerService;
use crate::cache::{AnswerKeyGenerator, SharedCache};
use crate::resilience::ConcurrencyGate;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Answers through the shared cache and the concurrency gate.
///
/// A cached answer is returned through the hit-tracked read, which also keeps
/// it alive. On a miss the downstream call runs under a gate permit and the
/// answer is stored with the default (or configured) TTL. While the store is
/// unreachable every query is a miss and nothing is stored.
pub struct GovernedAnswerer {
    cache: Arc<SharedCache>,
    gate: Arc<ConcurrencyGate>,
    service: Arc<dyn AnswerService>,
    keys: AnswerKeyGenerator,
    ttl: Option<Duration>,
}

impl GovernedAnswerer {
    pub fn new(
        cache: Arc<SharedCache>,
        gate: Arc<ConcurrencyGate>,
        service: Arc<dyn AnswerService>,
    ) -> Self {
        Self {
            cache,
            gate,
            service,
            keys: AnswerKeyGenerator::new(),
            ttl: None,
        }
    }

    pub fn with_keys(mut self, keys: AnswerKeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn cache_key(&self, query: &str) -> String {
        self.keys.generate(query)
    }
}

#[async_trait]
impl AnswerService for GovernedAnswerer {
    async fn answer(&self, query: &str) -> Result<String> {
        if query.trim().is_empty() {
            return Err(Error::validation_with_context(
                "query must not be empty",
                ErrorContext::new().with_field_path("messages[0].content"),
            ));
        }

        let key = self.keys.generate(query);
        match self.cache.read_json::<String>(&key).await {
            Ok(Some(text)) => {
                debug!(key = %key, "answer served from cache");
                return Ok(text);
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, error = %e, "answer cache skipped"),
        }

        let text = match self.gate.run(|| self.service.answer(query)).await? {
            Ok(text) => text,
            Err(e) => {
                error!(service = self.service.name(), error = %e, "downstream answering failed");
                return Err(e);
            }
        };

        if let Err(e) = self.cache.store_json(&key, &text, self.ttl).await {
            debug!(key = %key, error = %e, "answer not cached");
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "governed"
    }
}
