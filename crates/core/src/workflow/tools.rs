// Capabilities that let a TASK node drive the engine itself

use super::engine::WorkflowEngine;
use crate::capability::{Capability, InMemoryCapabilityRegistry};
use crate::types::{Context, WorkflowId};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

pub const WORKFLOW_EXECUTE: &str = "workflow_execute";
pub const WORKFLOW_LIST: &str = "workflow_list";

/// Context key carrying how many sub-workflows deep a run is
pub const WORKFLOW_DEPTH_KEY: &str = "_workflow_depth";

/// Runs a registered workflow as a sub-workflow.
///
/// Params: `workflow_id` (required) and `inputs` (optional map). The child
/// run's inputs get `_workflow_depth` one above the caller's, and calls past
/// `EngineConfig::max_workflow_depth` fail.
pub struct WorkflowExecuteCapability {
    engine: Weak<WorkflowEngine>,
}

/// Lists the workflows registered with the engine
pub struct WorkflowListCapability {
    engine: Weak<WorkflowEngine>,
}

fn upgrade(engine: &Weak<WorkflowEngine>) -> Result<Arc<WorkflowEngine>> {
    engine
        .upgrade()
        .ok_or_else(|| anyhow!("Workflow engine is no longer available"))
}

#[async_trait::async_trait]
impl Capability for WorkflowExecuteCapability {
    async fn invoke(&self, params: Context) -> Result<Value> {
        let workflow_id = params
            .get("workflow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("workflow_id is required"))?;
        let mut inputs = match params.get("inputs") {
            Some(Value::Object(inputs)) => inputs.clone(),
            Some(Value::Null) | None => Context::new(),
            Some(other) => return Err(anyhow!("inputs must be an object, got {}", other)),
        };

        let engine = upgrade(&self.engine)?;
        let depth = params
            .get(WORKFLOW_DEPTH_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let max_depth = u64::from(engine.config().max_workflow_depth);
        if depth >= max_depth {
            return Err(anyhow!(
                "sub-workflow nesting exceeds {} levels at {}",
                max_depth,
                workflow_id
            ));
        }
        inputs.insert(WORKFLOW_DEPTH_KEY.to_string(), json!(depth + 1));

        tracing::info!("Executing sub-workflow {} at depth {}", workflow_id, depth + 1);
        let run = engine.execute(&WorkflowId::new(workflow_id), inputs).await?;

        Ok(json!({
            "run_id": run.id.to_string(),
            "workflow_id": run.workflow_id,
            "status": run.status,
            "context": run.context,
            "error": run.error,
        }))
    }
}

#[async_trait::async_trait]
impl Capability for WorkflowListCapability {
    async fn invoke(&self, _params: Context) -> Result<Value> {
        let engine = upgrade(&self.engine)?;
        let workflows = engine.list_workflows().await;

        Ok(json!({
            "total": workflows.len(),
            "workflows": workflows,
        }))
    }
}

/// Expose `workflow_execute` and `workflow_list` through a registry.
///
/// The capabilities hold a weak reference, so the registry can live inside
/// the engine it points back to.
pub fn register_workflow_capabilities(
    engine: &Arc<WorkflowEngine>,
    registry: &InMemoryCapabilityRegistry,
) {
    registry.register(
        WORKFLOW_EXECUTE,
        Arc::new(WorkflowExecuteCapability {
            engine: Arc::downgrade(engine),
        }),
    );
    registry.register(
        WORKFLOW_LIST,
        Arc::new(WorkflowListCapability {
            engine: Arc::downgrade(engine),
        }),
    );
}
