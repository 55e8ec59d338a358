use super::dag::WorkflowDag;
use crate::capability::TaskHandler;
use crate::error::ValidationError;
use crate::types::{Context, NodeId, NodeType, WorkflowId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::sync::Arc;

/// What a TASK node runs: an in-process handler or a named capability
#[derive(Clone)]
pub enum NodeHandler {
    InProcess(Arc<dyn TaskHandler>),
    Capability(String),
}

impl std::fmt::Debug for NodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHandler::InProcess(_) => f.write_str("InProcess(..)"),
            NodeHandler::Capability(name) => f.debug_tuple("Capability").field(name).finish(),
        }
    }
}

/// Wire form of a handler. In-process handlers serialize as a marker only.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandlerRepr {
    InProcess,
    Capability { name: String },
}

impl Serialize for NodeHandler {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            NodeHandler::InProcess(_) => HandlerRepr::InProcess,
            NodeHandler::Capability(name) => HandlerRepr::Capability { name: name.clone() },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeHandler {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match HandlerRepr::deserialize(deserializer)? {
            HandlerRepr::Capability { name } => Ok(NodeHandler::Capability(name)),
            HandlerRepr::InProcess => Err(serde::de::Error::custom(
                "in-process handlers cannot be deserialized; use a capability name",
            )),
        }
    }
}

/// Single node in a workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<NodeHandler>,
    /// Parameters merged into named-capability calls
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: Context,
    /// How many times a failed body may be re-attempted
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: NodeId::new(id),
            name: name.into(),
            node_type,
            handler: None,
            config: Context::new(),
            retry_count: 0,
            timeout_ms: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, "Start", NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, "End", NodeType::End)
    }

    pub fn task(id: impl Into<String>, name: impl Into<String>, handler: NodeHandler) -> Self {
        let mut node = Self::new(id, name, NodeType::Task);
        node.handler = Some(handler);
        node
    }

    pub fn decision(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, NodeType::Decision)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, "Parallel Fork", NodeType::Parallel)
    }

    pub fn join(id: impl Into<String>) -> Self {
        Self::new(id, "Join", NodeType::Join)
    }

    pub fn with_config(mut self, config: Context) -> Self {
        self.config = config;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Directed edge between two nodes, optionally guarded by a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: NodeId::new(source),
            target: NodeId::new(target),
            condition: None,
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            condition: Some(condition.into()),
            ..Self::new(source, target)
        }
    }
}

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Context,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: Context::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn start_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes_of_type(NodeType::Start)
    }

    pub fn end_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes_of_type(NodeType::End)
    }

    fn nodes_of_type(&self, node_type: NodeType) -> Vec<&WorkflowNode> {
        self.nodes.iter().filter(|n| n.node_type == node_type).collect()
    }

    /// Targets of edges leaving `id`, in edge order
    pub fn successors(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.source == id)
            .map(|e| &e.target)
            .collect()
    }

    /// Sources of edges entering `id`, in edge order
    pub fn predecessors(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.target == id)
            .map(|e| &e.source)
            .collect()
    }

    /// First edge from `source` to `target`
    pub fn get_edge(&self, source: &NodeId, target: &NodeId) -> Option<&WorkflowEdge> {
        self.edges
            .iter()
            .find(|e| &e.source == source && &e.target == target)
    }

    /// Check structural invariants and return every violation found
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.start_nodes().is_empty() {
            errors.push(ValidationError::MissingStart);
        }
        if self.end_nodes().is_empty() {
            errors.push(ValidationError::MissingEnd);
        }

        let node_ids: HashSet<&NodeId> = self.nodes.iter().map(|n| &n.id).collect();
        for edge in &self.edges {
            if !node_ids.contains(&edge.source) {
                errors.push(ValidationError::UnknownEdgeSource(edge.source.clone()));
            }
            if !node_ids.contains(&edge.target) {
                errors.push(ValidationError::UnknownEdgeTarget(edge.target.clone()));
            }
        }

        if let Some((from, to)) = WorkflowDag::from_definition(self).find_back_edge() {
            errors.push(ValidationError::Cycle { from, to });
        }

        errors
    }

    /// Node ids that appear more than once, in first-seen order
    pub fn duplicate_node_ids(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) && !duplicates.contains(&node.id) {
                duplicates.push(node.id.clone());
            }
        }
        duplicates
    }
}
