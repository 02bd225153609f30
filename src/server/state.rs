use crate::admission::AdmissionController;
use crate::answer::AnswerService;
use crate::cache::SharedCache;
use crate::tracker::ClientActivityTracker;
use std::sync::Arc;

/// Handles shared by every request; cloned per request by axum.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SharedCache>,
    pub admission: Arc<AdmissionController>,
    pub answerer: Arc<dyn AnswerService>,
    /// Model name reported by `/v1/models` and chat responses.
    pub model: String,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(
        cache: Arc<SharedCache>,
        admission: Arc<AdmissionController>,
        answerer: Arc<dyn AnswerService>,
    ) -> Self {
        Self {
            cache,
            admission,
            answerer,
            model: "ai-governor".to_string(),
            api_key: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn tracker(&self) -> &Arc<ClientActivityTracker> {
        self.admission.tracker()
    }
}
