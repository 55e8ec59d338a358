use crate::types::{Context, NodeId, NodeStatus, NodeType, RunId, RunStatus, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime state of one node within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Body executions so far, including retries
    pub attempts: u32,
    /// Retries still available
    pub retries_remaining: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    pub fn pending(node_id: NodeId, node_type: NodeType, retries: u32) -> Self {
        Self {
            node_id,
            node_type,
            status: NodeStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            retries_remaining: retries,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution instance of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub context: Context,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Per-node state, in definition order
    #[serde(default)]
    pub nodes: Vec<NodeExecution>,
}

impl WorkflowRun {
    /// Fresh run whose context is a copy of the caller's inputs
    pub fn new(workflow_id: WorkflowId, inputs: Context) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            status: RunStatus::Running,
            context: inputs,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.node_id.as_str() == node_id)
    }

    /// Ids of nodes that ended FAILED
    pub fn failed_nodes(&self) -> Vec<&NodeId> {
        self.nodes_with_status(NodeStatus::Failed)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| &n.node_id)
            .collect()
    }

    /// Settle the run: failed if any node failed, completed otherwise
    pub fn finalize(&mut self) {
        let failed: Vec<String> = self.failed_nodes().iter().map(|id| id.to_string()).collect();
        if failed.is_empty() {
            self.status = RunStatus::Completed;
            self.error = None;
        } else {
            self.status = RunStatus::Failed;
            self.error = Some(format!("Nodes failed: [{}]", failed.join(", ")));
        }
        self.completed_at = Some(Utc::now());
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            context: self.context.clone(),
            error: self.error.clone(),
        }
    }
}

/// Caller-facing result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub context: Context,
    pub error: Option<String>,
}
