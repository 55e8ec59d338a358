use super::definition::{NodeHandler, WorkflowDefinition, WorkflowEdge, WorkflowNode};
use crate::error::{WorkflowError, WorkflowResult};
use crate::types::{Context, WorkflowId};

/// Fluent builder for workflow definitions
pub struct WorkflowBuilder {
    workflow: WorkflowDefinition,
    node_counter: usize,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut workflow = WorkflowDefinition::new("", name);
        workflow.id = WorkflowId::generate();
        Self {
            workflow,
            node_counter: 0,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.workflow.id = WorkflowId::new(id);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = description.into();
        self
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.node_counter += 1;
        format!("{}_{}", prefix, self.node_counter)
    }

    /// Add the `start` node
    pub fn start(mut self) -> Self {
        self.workflow.nodes.push(WorkflowNode::start("start"));
        self
    }

    /// Add the `end` node
    pub fn end(mut self) -> Self {
        self.workflow.nodes.push(WorkflowNode::end("end"));
        self
    }

    /// Add a task node; without an explicit id one is generated as `task_<n>`
    pub fn task(
        mut self,
        name: impl Into<String>,
        handler: NodeHandler,
        config: Option<Context>,
        node_id: Option<&str>,
    ) -> Self {
        let id = match node_id {
            Some(id) => id.to_string(),
            None => self.next_id("task"),
        };
        let node = WorkflowNode::task(id, name, handler).with_config(config.unwrap_or_default());
        self.workflow.nodes.push(node);
        self
    }

    /// Add a fully configured node as-is
    pub fn node(mut self, node: WorkflowNode) -> Self {
        self.workflow.nodes.push(node);
        self
    }

    pub fn decision(mut self, name: impl Into<String>, node_id: Option<&str>) -> Self {
        let id = match node_id {
            Some(id) => id.to_string(),
            None => self.next_id("decision"),
        };
        self.workflow.nodes.push(WorkflowNode::decision(id, name));
        self
    }

    pub fn parallel(mut self, node_id: Option<&str>) -> Self {
        let id = match node_id {
            Some(id) => id.to_string(),
            None => self.next_id("parallel"),
        };
        self.workflow.nodes.push(WorkflowNode::parallel(id));
        self
    }

    pub fn join(mut self, node_id: Option<&str>) -> Self {
        let id = match node_id {
            Some(id) => id.to_string(),
            None => self.next_id("join"),
        };
        self.workflow.nodes.push(WorkflowNode::join(id));
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.workflow.edges.push(WorkflowEdge::new(source, target));
        self
    }

    pub fn conditional_edge(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.workflow
            .edges
            .push(WorkflowEdge::conditional(source, target, condition));
        self
    }

    /// Connect the given nodes in sequence
    pub fn chain(mut self, node_ids: &[&str]) -> Self {
        for pair in node_ids.windows(2) {
            self.workflow.edges.push(WorkflowEdge::new(pair[0], pair[1]));
        }
        self
    }

    /// Validate and return the definition
    pub fn build(self) -> WorkflowResult<WorkflowDefinition> {
        let errors = self.workflow.validate();
        if !errors.is_empty() {
            return Err(WorkflowError::Validation(errors));
        }
        Ok(self.workflow)
    }
}
