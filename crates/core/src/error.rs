//! Error types for the workflow engine.

use crate::condition::ConditionError;
use crate::types::NodeId;

/// Result type for engine operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Structural problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Workflow must have at least one START node")]
    MissingStart,

    #[error("Workflow must have at least one END node")]
    MissingEnd,

    #[error("Edge source '{0}' not found")]
    UnknownEdgeSource(NodeId),

    #[error("Edge target '{0}' not found")]
    UnknownEdgeTarget(NodeId),

    /// The edge `from -> to` closes a cycle.
    #[error("Workflow contains a cycle through edge '{from}' -> '{to}'")]
    Cycle { from: NodeId, to: NodeId },

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(NodeId),
}

/// Error types surfaced by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The definition is malformed; carries every problem found.
    #[error("Invalid workflow: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// Unknown workflow or run id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A TASK body raised or its capability could not be resolved.
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: NodeId, message: String },

    /// A condition could not be evaluated. Treated like a false condition.
    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(#[from] ConditionError),

    /// A node body exceeded its timeout.
    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: NodeId, timeout_ms: u64 },

    /// A node body was cancelled because a sibling in its group failed.
    #[error("Node '{node_id}' cancelled")]
    Cancelled { node_id: NodeId },
}

impl WorkflowError {
    pub fn workflow_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "Workflow",
            id: id.to_string(),
        }
    }

    pub fn run_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: "Run",
            id: id.to_string(),
        }
    }

    pub fn node_execution(node_id: &NodeId, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.clone(),
            message: message.into(),
        }
    }

    /// Whether the failure consumes retry budget and may be re-attempted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeExecution { .. } | Self::Timeout { .. })
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
