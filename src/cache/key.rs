//! Cache key derivation.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Suffix of the co-located hit counter key.
pub const HITS_SUFFIX: &str = ":hits";

/// Prefix of cached downstream answers.
pub const ANSWER_PREFIX: &str = "answer";

/// `<key>:hits`, sharing the TTL lifecycle of `<key>`.
pub fn hits_key(key: &str) -> String {
    format!("{}{}", key, HITS_SUFFIX)
}

pub fn is_hits_key(key: &str) -> bool {
    key.ends_with(HITS_SUFFIX)
}

/// Derives stable answer-cache keys from a query.
///
/// Whitespace at the ends of the query is not significant; everything else is.
pub struct AnswerKeyGenerator {
    model: Option<String>,
    salt: Option<String>,
}

impl AnswerKeyGenerator {
    pub fn new() -> Self {
        Self {
            model: None,
            salt: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn generate(&self, query: &str) -> String {
        let mut parts: BTreeMap<&str, &str> = BTreeMap::new();
        parts.insert("query", query.trim());
        if let Some(ref m) = self.model {
            parts.insert("model", m);
        }
        if let Some(ref s) = self.salt {
            parts.insert("salt", s);
        }
        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        format!("{}:{}", ANSWER_PREFIX, hash)
    }
}

impl Default for AnswerKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}
