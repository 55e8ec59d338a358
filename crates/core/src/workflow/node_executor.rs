use super::definition::WorkflowNode;
use super::executor::{AttemptOutcome, RunScope};
use crate::capability::invoke_task;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventType;
use crate::types::{NodeId, NodeStatus, NodeType};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Execute a claimed (RUNNING) node through its retries until it settles.
///
/// Returns the node's final status: COMPLETED or FAILED.
pub(crate) async fn run_node(
    scope: &RunScope,
    node_id: &NodeId,
    group: Option<&CancellationToken>,
) -> NodeStatus {
    let Some(node) = scope.definition.get_node(node_id) else {
        tracing::error!("Node {} is not part of workflow {}", node_id, scope.definition.id);
        return NodeStatus::Failed;
    };

    let mut attempt = 1;
    loop {
        tracing::info!(
            "Executing node {} ({}, attempt {}) for run {}",
            node.id,
            node.node_type,
            attempt,
            scope.run_id
        );
        scope
            .emit(EventType::NodeStarted {
                node_id: node.id.clone(),
                node_type: node.node_type,
                attempt,
            })
            .await;

        let start = Instant::now();
        let outcome = execute_body(scope, node, group).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match scope.finish_attempt(&node.id, &outcome).await {
            AttemptOutcome::Completed => {
                tracing::info!("Node {} completed in {}ms", node.id, duration_ms);
                scope
                    .emit(EventType::NodeCompleted {
                        node_id: node.id.clone(),
                        node_type: node.node_type,
                        duration_ms,
                    })
                    .await;
                return NodeStatus::Completed;
            }
            AttemptOutcome::Retry { retries_remaining } => {
                let error = error_message(&outcome);
                tracing::warn!("Node {} failed (attempt {}): {}", node.id, attempt, error);
                scope
                    .emit(EventType::NodeFailed {
                        node_id: node.id.clone(),
                        node_type: node.node_type,
                        error,
                        attempt,
                        will_retry: true,
                    })
                    .await;

                let backoff = scope.config.retry_backoff(attempt);
                if !backoff.is_zero() {
                    tracing::info!("Retrying node {} after {:?}", node.id, backoff);
                    tokio::time::sleep(backoff).await;
                }

                scope.restart(&node.id).await;
                scope
                    .emit(EventType::NodeRetryScheduled {
                        node_id: node.id.clone(),
                        node_type: node.node_type,
                        retries_remaining,
                    })
                    .await;
                attempt += 1;
            }
            AttemptOutcome::Failed => {
                let error = error_message(&outcome);
                tracing::error!("Node {} failed (attempt {}): {}", node.id, attempt, error);
                scope
                    .emit(EventType::NodeFailed {
                        node_id: node.id.clone(),
                        node_type: node.node_type,
                        error,
                        attempt,
                        will_retry: false,
                    })
                    .await;

                if let Some(token) = group {
                    if scope.config.cancel_group_on_failure && !token.is_cancelled() {
                        tracing::warn!("Cancelling concurrency group after {} failed", node.id);
                        token.cancel();
                    }
                }
                return NodeStatus::Failed;
            }
        }
    }
}

/// One attempt of a node body. Only TASK nodes do work; TASK results are
/// returned here and merged into the context by the caller.
async fn execute_body(
    scope: &RunScope,
    node: &WorkflowNode,
    group: Option<&CancellationToken>,
) -> WorkflowResult<Option<Value>> {
    match node.node_type {
        NodeType::Start => Ok(Some(Value::Object(scope.context_snapshot().await))),
        NodeType::End | NodeType::Decision | NodeType::Parallel | NodeType::Join => Ok(None),
        NodeType::Task => {
            let task = run_task(scope, node);
            match group {
                Some(token) => tokio::select! {
                    result = task => result.map(Some),
                    _ = token.cancelled() => Err(WorkflowError::Cancelled {
                        node_id: node.id.clone(),
                    }),
                },
                None => task.await.map(Some),
            }
        }
    }
}

/// Invoke the TASK handler on a snapshot of the context, under its timeout.
/// A panicking handler counts as a failed attempt.
async fn run_task(scope: &RunScope, node: &WorkflowNode) -> WorkflowResult<Value> {
    let context = scope.context_snapshot().await;

    let body = AssertUnwindSafe(invoke_task(node, context, scope.capabilities.as_ref()))
        .catch_unwind()
        .map(|result| {
            result.unwrap_or_else(|panic| {
                Err(WorkflowError::node_execution(
                    &node.id,
                    format!("handler panicked: {}", panic_message(panic.as_ref())),
                ))
            })
        });

    match node.timeout_ms.or(scope.config.default_node_timeout_ms) {
        Some(timeout_ms) => match timeout(Duration::from_millis(timeout_ms), body).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Node {} timed out after {}ms", node.id, timeout_ms);
                Err(WorkflowError::Timeout {
                    node_id: node.id.clone(),
                    timeout_ms,
                })
            }
        },
        None => body.await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn error_message(outcome: &WorkflowResult<Option<Value>>) -> String {
    match outcome {
        Err(e) => e.to_string(),
        Ok(_) => String::new(),
    }
}
