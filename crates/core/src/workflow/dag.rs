use super::definition::WorkflowDefinition;
use crate::types::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent, EdgeRef};
use petgraph::Direction;
use std::collections::HashMap;

/// Adjacency index over a workflow definition.
///
/// Edge weights are positions in `WorkflowDefinition::edges`, so neighbour
/// lists come back in definition order and each edge's condition can be
/// looked up again.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<NodeId, usize>,
    node_indices: HashMap<NodeId, NodeIndex>,
}

impl WorkflowDag {
    /// Build the index. Edges with unknown endpoints are left out; validation reports them.
    pub fn from_definition(workflow: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in &workflow.nodes {
            node_indices
                .entry(node.id.clone())
                .or_insert_with(|| graph.add_node(node.id.clone()));
        }

        for (position, edge) in workflow.edges.iter().enumerate() {
            if let (Some(&source), Some(&target)) =
                (node_indices.get(&edge.source), node_indices.get(&edge.target))
            {
                graph.add_edge(source, target, position);
            }
        }

        Self {
            graph,
            node_indices,
        }
    }

    /// Find an edge that closes a cycle.
    ///
    /// Depth-first traversal over every node; an edge into a node that is
    /// still on the recursion stack (a back edge) means the graph is cyclic.
    pub fn find_back_edge(&self) -> Option<(NodeId, NodeId)> {
        depth_first_search(&self.graph, self.graph.node_indices(), |event| match event {
            DfsEvent::BackEdge(from, to) => Control::Break((from, to)),
            _ => Control::Continue,
        })
        .break_value()
        .map(|(from, to)| (self.graph[from].clone(), self.graph[to].clone()))
    }

    /// Successor ids in edge order; repeated edges yield repeated ids
    pub fn successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbours(node_id, Direction::Outgoing)
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }

    /// Predecessor ids in edge order
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbours(node_id, Direction::Incoming)
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }

    /// Positions of the edges entering a node, in edge order
    pub fn incoming_edges(&self, node_id: &NodeId) -> Vec<usize> {
        self.neighbours(node_id, Direction::Incoming)
            .into_iter()
            .map(|(position, _)| position)
            .collect()
    }

    fn neighbours(&self, node_id: &NodeId, direction: Direction) -> Vec<(usize, NodeId)> {
        let Some(&index) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut neighbours: Vec<(usize, NodeId)> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                (*edge.weight(), self.graph[other].clone())
            })
            .collect();
        neighbours.sort_by_key(|(position, _)| *position);
        neighbours
    }
}
