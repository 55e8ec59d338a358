use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the workflow engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for node bodies that do not set their own
    #[serde(default)]
    pub default_node_timeout_ms: Option<u64>,

    /// Delay before the first retry, doubled for each further retry (0 = retry at once)
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Cancel in-flight siblings of a concurrency group when one member fails
    #[serde(default)]
    pub cancel_group_on_failure: bool,

    /// Finished runs kept for lookup; the oldest are evicted past this (None = keep all)
    #[serde(default)]
    pub max_retained_runs: Option<usize>,

    /// Deepest chain of sub-workflows started through `workflow_execute`
    #[serde(default = "default_max_workflow_depth")]
    pub max_workflow_depth: u32,
}

fn default_max_workflow_depth() -> u32 {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: None,
            retry_backoff_ms: 0,
            cancel_group_on_failure: false,
            max_retained_runs: None,
            max_workflow_depth: default_max_workflow_depth(),
        }
    }
}

impl EngineConfig {
    /// Backoff before retry number `retry` (1-based)
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        if self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
