use super::dag::WorkflowDag;
use super::definition::WorkflowDefinition;
use super::node_executor;
use super::run::NodeExecution;
use crate::capability::{merge_result, CapabilityRegistry};
use crate::condition::evaluate_condition;
use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::events::{Event, EventLog, EventType};
use crate::types::{Context, NodeId, NodeStatus, NodeType, RunId};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Outcome of checking a node for admission into the current wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Claimed: the node is now RUNNING and owned by the caller
    Run,
    /// A guarding condition was false or failed to evaluate
    Skipped,
    /// Some predecessor has not settled yet; leave it for a later wave
    Wait,
    /// Already claimed, finished, or unknown
    Done,
}

/// Result of one body attempt, as recorded in the node table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Completed,
    Retry { retries_remaining: u32 },
    Failed,
}

/// Everything one run needs while it executes.
///
/// Node state and the context live behind their own locks; whenever both are
/// needed the node table is locked first.
pub(crate) struct RunScope {
    pub run_id: RunId,
    pub definition: Arc<WorkflowDefinition>,
    pub dag: Arc<WorkflowDag>,
    pub capabilities: Arc<dyn CapabilityRegistry>,
    pub config: EngineConfig,
    event_log: Arc<dyn EventLog>,
    nodes: Mutex<HashMap<NodeId, NodeExecution>>,
    context: Mutex<Context>,
}

impl RunScope {
    pub fn new(
        run_id: RunId,
        definition: Arc<WorkflowDefinition>,
        dag: Arc<WorkflowDag>,
        capabilities: Arc<dyn CapabilityRegistry>,
        event_log: Arc<dyn EventLog>,
        config: EngineConfig,
        context: Context,
    ) -> Self {
        let nodes = definition
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeExecution::pending(n.id.clone(), n.node_type, n.retry_count),
                )
            })
            .collect();

        Self {
            run_id,
            definition,
            dag,
            capabilities,
            config,
            event_log,
            nodes: Mutex::new(nodes),
            context: Mutex::new(context),
        }
    }

    /// Append an event; a failing log never fails the run
    pub async fn emit(&self, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(self.run_id, event_type)).await {
            tracing::error!("Failed to append event for run {}: {:#}", self.run_id, e);
        }
    }

    pub async fn context_snapshot(&self) -> Context {
        self.context.lock().await.clone()
    }

    fn node_type(&self, node_id: &NodeId) -> NodeType {
        self.definition
            .get_node(node_id)
            .map(|n| n.node_type)
            .unwrap_or(NodeType::Task)
    }

    /// Readiness check and condition gate, claiming the node atomically
    pub async fn admit(&self, node_id: &NodeId) -> Admission {
        let mut nodes = self.nodes.lock().await;

        match nodes.get(node_id) {
            Some(exec) if exec.status == NodeStatus::Pending => {}
            _ => return Admission::Done,
        }

        let ready = self.dag.predecessors(node_id).iter().all(|p| {
            nodes
                .get(p)
                .map(|exec| exec.status.is_settled())
                .unwrap_or(true)
        });
        if !ready {
            return Admission::Wait;
        }

        let skip_reason = {
            let context = self.context.lock().await;
            self.dag
                .incoming_edges(node_id)
                .into_iter()
                .filter_map(|position| self.definition.edges.get(position))
                .find_map(|edge| {
                    let condition = edge.condition.as_deref()?;
                    match evaluate_condition(condition, &context) {
                        Ok(true) => None,
                        Ok(false) => Some(format!(
                            "condition '{}' on edge from '{}' is false",
                            condition, edge.source
                        )),
                        Err(e) => Some(format!(
                            "{} (edge from '{}')",
                            WorkflowError::from(e),
                            edge.source
                        )),
                    }
                })
        };

        let Some(exec) = nodes.get_mut(node_id) else {
            return Admission::Done;
        };
        let now = Utc::now();

        match skip_reason {
            Some(reason) => {
                exec.status = NodeStatus::Skipped;
                exec.completed_at = Some(now);
                drop(nodes);

                tracing::info!("Skipping node {}: {}", node_id, reason);
                self.emit(EventType::NodeSkipped {
                    node_id: node_id.clone(),
                    node_type: self.node_type(node_id),
                    reason,
                })
                .await;
                Admission::Skipped
            }
            None => {
                exec.status = NodeStatus::Running;
                exec.started_at = Some(now);
                Admission::Run
            }
        }
    }

    /// Record a body attempt's outcome; TASK results are merged into the context here
    pub async fn finish_attempt(
        &self,
        node_id: &NodeId,
        outcome: &Result<Option<Value>, WorkflowError>,
    ) -> AttemptOutcome {
        let mut nodes = self.nodes.lock().await;
        let Some(exec) = nodes.get_mut(node_id) else {
            return AttemptOutcome::Failed;
        };

        exec.attempts += 1;
        exec.completed_at = Some(Utc::now());

        match outcome {
            Ok(result) => {
                if exec.node_type == NodeType::Task {
                    if let Some(result) = result {
                        merge_result(&mut *self.context.lock().await, result);
                    }
                }
                exec.status = NodeStatus::Completed;
                exec.result = result.clone();
                exec.error = None;
                AttemptOutcome::Completed
            }
            Err(err) => {
                exec.status = NodeStatus::Failed;
                exec.error = Some(err.to_string());
                if err.is_retryable() && exec.retries_remaining > 0 {
                    exec.retries_remaining -= 1;
                    AttemptOutcome::Retry {
                        retries_remaining: exec.retries_remaining,
                    }
                } else {
                    AttemptOutcome::Failed
                }
            }
        }
    }

    /// Put a failed node back to work for its next attempt.
    ///
    /// FAILED -> PENDING -> RUNNING happens under one lock, so the node is
    /// never observably PENDING and no other branch can claim it.
    pub async fn restart(&self, node_id: &NodeId) {
        let mut nodes = self.nodes.lock().await;
        if let Some(exec) = nodes.get_mut(node_id) {
            exec.status = NodeStatus::Running;
            exec.started_at = Some(Utc::now());
            exec.completed_at = None;
        }
    }

    /// Distinct PENDING successors of the nodes completed in a wave
    pub async fn next_wave(&self, completed: &[NodeId]) -> Vec<NodeId> {
        let nodes = self.nodes.lock().await;
        let mut next: Vec<NodeId> = Vec::new();

        for node_id in completed {
            for successor in self.dag.successors(node_id) {
                let pending = nodes
                    .get(&successor)
                    .is_some_and(|exec| exec.status == NodeStatus::Pending);
                if pending && !next.contains(&successor) {
                    next.push(successor);
                }
            }
        }

        next
    }

    /// Split a wave into dispatch groups.
    ///
    /// Nodes gated only by PARALLEL predecessors form one concurrent group;
    /// every other node is a group of its own. Groups keep wave order.
    pub fn concurrency_groups(&self, wave: Vec<NodeId>) -> Vec<Vec<NodeId>> {
        let mut groups: Vec<Vec<NodeId>> = Vec::new();
        let mut fan_out: Option<usize> = None;

        for node_id in wave {
            if self.is_fan_out_member(&node_id) {
                match fan_out {
                    Some(index) => groups[index].push(node_id),
                    None => {
                        fan_out = Some(groups.len());
                        groups.push(vec![node_id]);
                    }
                }
            } else {
                groups.push(vec![node_id]);
            }
        }

        groups
    }

    fn is_fan_out_member(&self, node_id: &NodeId) -> bool {
        let predecessors = self.dag.predecessors(node_id);
        !predecessors.is_empty()
            && predecessors.iter().all(|p| {
                self.definition
                    .get_node(p)
                    .is_some_and(|n| n.node_type == NodeType::Parallel)
            })
    }

    /// Final context and node table in definition order
    pub async fn final_state(&self) -> (Context, Vec<NodeExecution>) {
        let nodes = self.nodes.lock().await;
        let executions = self
            .definition
            .nodes
            .iter()
            .filter_map(|n| nodes.get(&n.id).cloned())
            .collect();
        (self.context.lock().await.clone(), executions)
    }
}

/// Process one wave, then recurse into the waves it unlocks.
///
/// `group` is the cancellation token of the concurrency group this wave runs
/// in, if any.
pub(crate) fn execute_wave(
    scope: Arc<RunScope>,
    wave: Vec<NodeId>,
    group: Option<CancellationToken>,
) -> BoxFuture<'static, ()> {
    async move {
        let mut completed = Vec::new();

        for node_id in wave {
            if group.as_ref().is_some_and(|token| token.is_cancelled()) {
                tracing::debug!("Group cancelled, leaving {} pending", node_id);
                return;
            }

            if scope.admit(&node_id).await != Admission::Run {
                continue;
            }

            let status = node_executor::run_node(&scope, &node_id, group.as_ref()).await;
            if status == NodeStatus::Completed {
                completed.push(node_id);
            }
        }

        let next = scope.next_wave(&completed).await;
        if next.is_empty() {
            return;
        }
        tracing::debug!("Next wave for run {}: {:?}", scope.run_id, next);

        for members in scope.concurrency_groups(next) {
            if members.len() > 1 {
                dispatch_group(scope.clone(), members, group.as_ref()).await;
            } else {
                execute_wave(scope.clone(), members, group.clone()).await;
            }
        }
    }
    .boxed()
}

/// Fan out: run each member on its own task and wait for all of them (fan in)
async fn dispatch_group(
    scope: Arc<RunScope>,
    members: Vec<NodeId>,
    parent: Option<&CancellationToken>,
) {
    let token = parent
        .map(|t| t.child_token())
        .unwrap_or_default();

    tracing::debug!(
        "Dispatching concurrency group for run {}: {:?}",
        scope.run_id,
        members
    );

    let handles: Vec<_> = members
        .into_iter()
        .map(|node_id| {
            tokio::spawn(execute_wave(
                scope.clone(),
                vec![node_id],
                Some(token.clone()),
            ))
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!("Concurrency group member aborted in run {}: {}", scope.run_id, e);
        }
    }
}
