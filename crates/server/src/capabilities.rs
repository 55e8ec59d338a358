// Capabilities every server instance provides

use anyhow::{anyhow, Result};
use dagrun_core::capability::InMemoryCapabilityRegistry;
use dagrun_core::types::Context;
use serde_json::Value;
use std::time::Duration;

/// Register `echo` and `delay`
pub fn register_builtins(registry: &InMemoryCapabilityRegistry) {
    registry.register_fn("echo", echo);
    registry.register_fn("delay", delay);
}

/// Returns its parameters unchanged
async fn echo(params: Context) -> Result<Value> {
    Ok(Value::Object(params))
}

/// Sleeps for `delay_ms` milliseconds
async fn delay(params: Context) -> Result<Value> {
    let delay_ms = match params.get("delay_ms") {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| anyhow!("delay_ms must be a non-negative integer, got {}", value))?,
    };

    tracing::debug!("Delaying for {}ms", delay_ms);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Ok(Value::Object(Context::new()))
}
