use proccore::{ProcError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy for steps that do not declare their own
    pub default_retry: RetryPolicy,
    /// Per-attempt timeout for steps that do not declare their own;
    /// `None` leaves attempts unbounded
    pub default_timeout_ms: Option<u64>,
    pub event_buffer_size: usize,
    /// Lifetime of status cache entries
    pub cache_ttl_ms: u64,
    /// Context key that receives the error before a failure-transition
    pub failure_context_key: String,
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProcError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::none(),
            default_timeout_ms: None,
            event_buffer_size: 1000,
            cache_ttl_ms: 30_000,
            failure_context_key: "error".to_string(),
        }
    }
}
