use super::dag::WorkflowDag;
use super::definition::WorkflowDefinition;
use super::executor::{execute_wave, RunScope};
use super::run::{RunSummary, WorkflowRun};
use crate::capability::CapabilityRegistry;
use crate::config::EngineConfig;
use crate::error::{ValidationError, WorkflowError, WorkflowResult};
use crate::events::{Event, EventLog, EventType, InMemoryEventLog};
use crate::types::{Context, NodeId, RunId, RunStatus, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::Instrument;

/// Listing entry for a registered workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub node_count: usize,
}

#[derive(Clone)]
struct RegisteredWorkflow {
    definition: Arc<WorkflowDefinition>,
    dag: Arc<WorkflowDag>,
}

/// Registers workflow definitions and executes runs of them.
///
/// Every run gets its own node table and context, so one engine can drive
/// any number of runs of the same definition at once.
pub struct WorkflowEngine {
    config: EngineConfig,
    capabilities: Arc<dyn CapabilityRegistry>,
    event_log: Arc<dyn EventLog>,
    workflows: RwLock<HashMap<WorkflowId, RegisteredWorkflow>>,
    runs: RwLock<HashMap<RunId, WorkflowRun>>,
}

impl WorkflowEngine {
    pub fn new(capabilities: Arc<dyn CapabilityRegistry>) -> Self {
        Self {
            config: EngineConfig::default(),
            capabilities,
            event_log: Arc::new(InMemoryEventLog::new()),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Arc<dyn CapabilityRegistry> {
        self.capabilities.clone()
    }

    /// Validate and store a definition, replacing any with the same id
    pub async fn register(&self, definition: WorkflowDefinition) -> WorkflowResult<()> {
        let mut errors: Vec<ValidationError> = definition
            .duplicate_node_ids()
            .into_iter()
            .map(ValidationError::DuplicateNode)
            .collect();
        errors.extend(definition.validate());

        if !errors.is_empty() {
            tracing::warn!(
                "Rejected workflow {}: {} validation error(s)",
                definition.id,
                errors.len()
            );
            return Err(WorkflowError::Validation(errors));
        }

        let dag = WorkflowDag::from_definition(&definition);
        let id = definition.id.clone();
        let registered = RegisteredWorkflow {
            definition: Arc::new(definition),
            dag: Arc::new(dag),
        };

        if self.workflows.write().await.insert(id.clone(), registered).is_some() {
            tracing::info!("Replaced workflow definition {}", id);
        } else {
            tracing::info!("Registered workflow {}", id);
        }
        Ok(())
    }

    pub async fn get(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| w.definition.clone())
    }

    /// Registered workflows, sorted by id
    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .read()
            .await
            .values()
            .map(|w| WorkflowSummary {
                id: w.definition.id.clone(),
                name: w.definition.name.clone(),
                description: w.definition.description.clone(),
                node_count: w.definition.nodes.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        summaries
    }

    /// Execute one run of a registered workflow to completion.
    ///
    /// Node failures do not make this an error; they show up in the returned
    /// run's status and node table.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        inputs: Context,
    ) -> WorkflowResult<WorkflowRun> {
        let registered = self
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow_id))?;

        let run = WorkflowRun::new(workflow_id.clone(), inputs);
        let span = tracing::info_span!("run", run_id = %run.id, workflow_id = %workflow_id);

        self.execute_run(registered, run).instrument(span).await
    }

    async fn execute_run(
        &self,
        registered: RegisteredWorkflow,
        mut run: WorkflowRun,
    ) -> WorkflowResult<WorkflowRun> {
        let started = std::time::Instant::now();
        tracing::info!("Starting workflow execution: run_id={}", run.id);

        self.runs.write().await.insert(run.id, run.clone());

        let start_nodes: Vec<NodeId> = registered
            .definition
            .start_nodes()
            .into_iter()
            .map(|n| n.id.clone())
            .collect();

        let scope = Arc::new(RunScope::new(
            run.id,
            registered.definition,
            registered.dag,
            self.capabilities.clone(),
            self.event_log.clone(),
            self.config.clone(),
            run.context.clone(),
        ));

        scope
            .emit(EventType::RunStarted {
                workflow_id: run.workflow_id.clone(),
            })
            .await;

        execute_wave(scope.clone(), start_nodes, None).await;

        let (context, nodes) = scope.final_state().await;
        run.context = context;
        run.nodes = nodes;
        run.finalize();

        let duration_ms = started.elapsed().as_millis() as u64;
        match (&run.status, &run.error) {
            (RunStatus::Failed, Some(error)) => {
                tracing::error!("Workflow execution failed: run_id={}, error={}", run.id, error);
                scope
                    .emit(EventType::RunFailed {
                        error: error.clone(),
                        duration_ms,
                    })
                    .await;
            }
            _ => {
                tracing::info!(
                    "Workflow execution completed: run_id={} in {}ms",
                    run.id,
                    duration_ms
                );
                scope.emit(EventType::RunCompleted { duration_ms }).await;
            }
        }

        self.runs.write().await.insert(run.id, run.clone());
        self.evict_finished_runs().await;
        Ok(run)
    }

    /// Drop the oldest finished runs beyond `max_retained_runs`
    async fn evict_finished_runs(&self) {
        let Some(limit) = self.config.max_retained_runs else {
            return;
        };

        let evicted: Vec<RunId> = {
            let mut runs = self.runs.write().await;
            let mut finished: Vec<(RunId, DateTime<Utc>)> = runs
                .values()
                .filter_map(|r| r.completed_at.map(|at| (r.id, at)))
                .collect();
            if finished.len() <= limit {
                return;
            }
            finished.sort_by_key(|(_, completed_at)| *completed_at);
            let excess = finished.len() - limit;
            let mut evicted = Vec::with_capacity(excess);
            for (run_id, _) in finished.into_iter().take(excess) {
                runs.remove(&run_id);
                evicted.push(run_id);
            }
            evicted
        };

        for run_id in evicted {
            if let Err(e) = self.event_log.remove_run(run_id).await {
                tracing::warn!("Failed to drop events of evicted run {}: {}", run_id, e);
            }
            tracing::debug!("Evicted run {}", run_id);
        }
    }

    /// Register the definition unless its id is already known, then execute it
    pub async fn run_definition(
        &self,
        definition: WorkflowDefinition,
        inputs: Context,
    ) -> WorkflowResult<RunSummary> {
        let workflow_id = definition.id.clone();
        if self.get(&workflow_id).await.is_none() {
            self.register(definition).await?;
        }
        Ok(self.execute(&workflow_id, inputs).await?.summary())
    }

    pub async fn get_run(&self, run_id: RunId) -> WorkflowResult<WorkflowRun> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| WorkflowError::run_not_found(run_id))
    }

    /// All known runs, oldest first
    pub async fn list_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Event history of a run
    pub async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        if !self.runs.read().await.contains_key(&run_id) {
            return Err(WorkflowError::run_not_found(run_id).into());
        }
        self.event_log.get_run_events(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{handler_fn, InMemoryCapabilityRegistry};
    use crate::types::{NodeStatus, NodeType};
    use crate::workflow::{NodeHandler, WorkflowBuilder, WorkflowEdge, WorkflowNode};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(InMemoryCapabilityRegistry::new()))
    }

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    fn returns(value: Value) -> NodeHandler {
        NodeHandler::InProcess(handler_fn(move |_ctx: Context| {
            let value = value.clone();
            async move { Ok(value) }
        }))
    }

    fn failing(message: &'static str) -> NodeHandler {
        NodeHandler::InProcess(handler_fn(move |_ctx: Context| async move {
            Err(anyhow::anyhow!(message))
        }))
    }

    /// Fails the first `failures` calls, then returns `{"ok": true}`
    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> NodeHandler {
        NodeHandler::InProcess(handler_fn(move |_ctx: Context| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    Err(anyhow::anyhow!("transient failure {}", call))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        }))
    }

    fn sleeps(duration: Duration, value: Value) -> NodeHandler {
        NodeHandler::InProcess(handler_fn(move |_ctx: Context| {
            let value = value.clone();
            async move {
                tokio::time::sleep(duration).await;
                Ok(value)
            }
        }))
    }

    fn status(run: &WorkflowRun, node_id: &str) -> NodeStatus {
        run.node(node_id).map(|n| n.status).unwrap()
    }

    fn fan_out(branches: Vec<(&str, NodeHandler)>) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new("fan", "Fan out")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::parallel("fork"))
            .with_node(WorkflowNode::join("join"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "fork"));
        for (id, handler) in branches {
            definition = definition
                .with_node(WorkflowNode::task(id, id, handler))
                .with_edge(WorkflowEdge::new("fork", id))
                .with_edge(WorkflowEdge::new(id, "join"));
        }
        definition.with_edge(WorkflowEdge::new("join", "end"))
    }

    #[tokio::test]
    async fn test_linear_chain_threads_context() {
        let engine = engine();
        let definition = WorkflowBuilder::new("Linear")
            .id("linear")
            .start()
            .task("Set", returns(json!({"x": 1})), None, Some("t1"))
            .task(
                "Read",
                NodeHandler::InProcess(handler_fn(|ctx: Context| async move {
                    Ok(json!({"seen": ctx.get("x").cloned().unwrap_or(Value::Null)}))
                })),
                None,
                Some("t2"),
            )
            .end()
            .chain(&["start", "t1", "t2", "end"])
            .build()
            .unwrap();
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("linear"), ctx(json!({"input": "a"})))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context, ctx(json!({"input": "a", "x": 1, "seen": 1})));
        for id in ["start", "t1", "t2", "end"] {
            assert_eq!(status(&run, id), NodeStatus::Completed);
        }
        // START's result is the context it saw
        assert_eq!(run.node("start").unwrap().result, Some(json!({"input": "a"})));
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let definition = WorkflowDefinition::new("retry", "Retry")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Flaky", flaky(2, calls.clone())).with_retries(2))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("retry"), Context::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let node = run.node("t").unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.attempts, 3);
        assert_eq!(node.retries_remaining, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(status(&run, "end"), NodeStatus::Completed);

        let events = engine.get_run_events(run.id).await.unwrap();
        let retries = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::NodeRetryScheduled { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let engine = engine();
        let definition = WorkflowDefinition::new("exhaust", "Exhaust")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Broken", failing("always")).with_retries(1))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("exhaust"), Context::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("Nodes failed: [t]"));
        let node = run.node("t").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.attempts, 2);
        assert!(node.error.as_deref().unwrap().contains("always"));
        assert_eq!(status(&run, "end"), NodeStatus::Pending);
    }

    async fn decision_run(x: i64) -> WorkflowRun {
        let engine = engine();
        let definition = WorkflowDefinition::new("decide", "Decide")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::decision("d", "Sign"))
            .with_node(WorkflowNode::task("pos", "Positive", returns(json!({"branch": "pos"}))))
            .with_node(WorkflowNode::task("neg", "Negative", returns(json!({"branch": "neg"}))))
            .with_edge(WorkflowEdge::new("start", "d"))
            .with_edge(WorkflowEdge::conditional("d", "pos", "x > 0"))
            .with_edge(WorkflowEdge::conditional("d", "neg", "x <= 0"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("pos", "end"));
        engine.register(definition).await.unwrap();
        engine
            .execute(&WorkflowId::new("decide"), ctx(json!({"x": x})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_decision_routes_on_context() {
        let run = decision_run(5).await;
        assert_eq!(status(&run, "pos"), NodeStatus::Completed);
        assert_eq!(status(&run, "neg"), NodeStatus::Skipped);
        assert_eq!(status(&run, "end"), NodeStatus::Completed);
        assert_eq!(run.context.get("branch"), Some(&json!("pos")));
        assert_eq!(run.status, RunStatus::Completed);

        let run = decision_run(-1).await;
        assert_eq!(status(&run, "pos"), NodeStatus::Skipped);
        assert_eq!(status(&run, "neg"), NodeStatus::Completed);
        // every path into `end` was gated off, so it never runs
        assert_eq!(status(&run, "end"), NodeStatus::Pending);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_condition_error_skips_target() {
        let engine = engine();
        let definition = WorkflowDefinition::new("gate", "Gate")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Guarded", returns(json!({"ran": true}))))
            .with_edge(WorkflowEdge::conditional("start", "t", "missing.key > 3"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("gate"), Context::new())
            .await
            .unwrap();
        assert_eq!(status(&run, "t"), NodeStatus::Skipped);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.context.contains_key("ran"));

        let events = engine.get_run_events(run.id).await.unwrap();
        let reason = events.iter().find_map(|e| match &e.event_type {
            EventType::NodeSkipped { reason, .. } => Some(reason.clone()),
            _ => None,
        });
        assert!(reason.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_parallel_branches_run_concurrently_and_join_once() {
        let engine = engine();
        // each branch waits until all three are inside their bodies
        let barrier = Arc::new(Barrier::new(3));
        let joins = Arc::new(AtomicU32::new(0));
        let meet = |key: &'static str| {
            let barrier = barrier.clone();
            NodeHandler::InProcess(handler_fn(move |_ctx: Context| {
                let barrier = barrier.clone();
                async move {
                    tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                        .await
                        .map_err(|_| anyhow::anyhow!("branches did not overlap"))?;
                    Ok(json!({ key: true }))
                }
            }))
        };

        let counter = joins.clone();
        let definition = fan_out(vec![("a", meet("a")), ("b", meet("b")), ("c", meet("c"))])
            .with_node(WorkflowNode::task(
                "after",
                "After join",
                NodeHandler::InProcess(handler_fn(move |_ctx: Context| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })),
            ))
            .with_edge(WorkflowEdge::new("join", "after"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("fan"), Context::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed, "{:?}", run.error);
        assert_eq!(run.context, ctx(json!({"a": true, "b": true, "c": true})));
        assert_eq!(status(&run, "join"), NodeStatus::Completed);
        assert_eq!(run.node("join").unwrap().attempts, 1);
        assert_eq!(joins.load(Ordering::SeqCst), 1);

        let events = engine.get_run_events(run.id).await.unwrap();
        let join_starts = events
            .iter()
            .filter(|e| {
                matches!(&e.event_type, EventType::NodeStarted { node_type: NodeType::Join, .. })
            })
            .count();
        assert_eq!(join_starts, 1);
    }

    #[tokio::test]
    async fn test_failed_branch_blocks_join() {
        let engine = engine();
        let definition = fan_out(vec![
            ("a", returns(json!({"a": 1}))),
            ("b", failing("branch b broke")),
            ("c", returns(json!({"c": 3}))),
        ]);
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("fan"), Context::new())
            .await
            .unwrap();

        assert_eq!(status(&run, "a"), NodeStatus::Completed);
        assert_eq!(status(&run, "b"), NodeStatus::Failed);
        assert_eq!(status(&run, "c"), NodeStatus::Completed);
        assert_eq!(status(&run, "join"), NodeStatus::Pending);
        assert_eq!(status(&run, "end"), NodeStatus::Pending);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains('b'));
    }

    #[tokio::test]
    async fn test_retry_does_not_drop_siblings() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let mut definition = fan_out(vec![
            ("flaky", flaky(1, calls.clone())),
            ("steady", returns(json!({"steady": true}))),
        ]);
        for node in definition.nodes.iter_mut() {
            if node.id.as_str() == "flaky" {
                node.retry_count = 1;
            }
        }
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("fan"), Context::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node("flaky").unwrap().attempts, 2);
        assert_eq!(status(&run, "steady"), NodeStatus::Completed);
        assert_eq!(status(&run, "join"), NodeStatus::Completed);
        assert_eq!(status(&run, "end"), NodeStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_node() {
        let engine = engine();
        let definition = WorkflowDefinition::new("slow", "Slow")
            .with_node(WorkflowNode::start("start"))
            .with_node(
                WorkflowNode::task("t", "Slow", sleeps(Duration::from_secs(10), json!({})))
                    .with_timeout_ms(50),
            )
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("slow"), Context::new())
            .await
            .unwrap();

        let node = run.node("t").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(node.error.as_deref().unwrap().contains("timed out after 50ms"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_and_backoff_apply() {
        let engine = engine().with_config(EngineConfig {
            default_node_timeout_ms: Some(100),
            retry_backoff_ms: 1_000,
            ..Default::default()
        });
        let definition = WorkflowDefinition::new("slow", "Slow")
            .with_node(WorkflowNode::start("start"))
            .with_node(
                WorkflowNode::task("t", "Slow", sleeps(Duration::from_secs(10), json!({})))
                    .with_retries(2),
            )
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let started = tokio::time::Instant::now();
        let run = engine
            .execute(&WorkflowId::new("slow"), Context::new())
            .await
            .unwrap();

        assert_eq!(run.node("t").unwrap().attempts, 3);
        // three 100ms timeouts plus 1s and 2s of backoff
        assert!(started.elapsed() >= Duration::from_millis(3_300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_cancellation_policy() {
        // fails shortly after both branches are in flight
        let fail_soon = || {
            NodeHandler::InProcess(handler_fn(|_ctx: Context| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(anyhow::anyhow!("fast failure"))
            }))
        };
        let definition = || {
            fan_out(vec![
                ("fast_fail", fail_soon()),
                ("slow", sleeps(Duration::from_secs(10), json!({"slow": true}))),
            ])
        };

        // default: siblings run to completion
        let engine = engine();
        engine.register(definition()).await.unwrap();
        let run = engine
            .execute(&WorkflowId::new("fan"), Context::new())
            .await
            .unwrap();
        assert_eq!(status(&run, "slow"), NodeStatus::Completed);

        let engine = self::engine().with_config(EngineConfig {
            cancel_group_on_failure: true,
            ..Default::default()
        });
        engine.register(definition()).await.unwrap();
        let run = engine
            .execute(&WorkflowId::new("fan"), Context::new())
            .await
            .unwrap();
        let slow = run.node("slow").unwrap();
        assert_eq!(slow.status, NodeStatus::Failed);
        assert!(slow.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_node() {
        let engine = engine();
        let definition = WorkflowDefinition::new("panic", "Panic")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task(
                "t",
                "Panics",
                NodeHandler::InProcess(handler_fn(|_ctx: Context| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(Value::Null)
                })),
            ))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("panic"), Context::new())
            .await
            .unwrap();
        let node = run.node("t").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(node.error.as_deref().unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_runs_are_independent() {
        let engine = Arc::new(engine());
        let barrier = Arc::new(Barrier::new(2));
        let handler = {
            let barrier = barrier.clone();
            NodeHandler::InProcess(handler_fn(move |ctx: Context| {
                let barrier = barrier.clone();
                async move {
                    tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                        .await
                        .map_err(|_| anyhow::anyhow!("runs did not overlap"))?;
                    let n = ctx.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok(json!({"doubled": n * 2}))
                }
            }))
        };
        let definition = WorkflowDefinition::new("double", "Double")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Double", handler))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let id = WorkflowId::new("double");
        let (first, second) = tokio::join!(
            engine.execute(&id, ctx(json!({"n": 1}))),
            engine.execute(&id, ctx(json!({"n": 2}))),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first.id, second.id);
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(first.context.get("doubled"), Some(&json!(2)));
        assert_eq!(second.context.get("doubled"), Some(&json!(4)));
        assert_eq!(engine.list_runs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_same_inputs_same_outcome() {
        let engine = engine();
        let definition = WorkflowDefinition::new("pure", "Pure")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Set", returns(json!({"y": 2}))))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let id = WorkflowId::new("pure");
        let first = engine.execute(&id, ctx(json!({"x": 1}))).await.unwrap();
        let second = engine.execute(&id, ctx(json!({"x": 1}))).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.context, second.context);
        assert_eq!(
            first.nodes.iter().map(|n| n.status).collect::<Vec<_>>(),
            second.nodes.iter().map(|n| n.status).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definitions() {
        let engine = engine();

        let cyclic = WorkflowDefinition::new("cyclic", "Cyclic")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("a", "A", returns(Value::Null)))
            .with_node(WorkflowNode::task("b", "B", returns(Value::Null)))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "a"))
            .with_edge(WorkflowEdge::new("a", "b"))
            .with_edge(WorkflowEdge::new("b", "a"))
            .with_edge(WorkflowEdge::new("b", "end"));
        match engine.register(cyclic).await {
            Err(WorkflowError::Validation(errors)) => {
                assert!(errors.iter().any(|e| matches!(e, ValidationError::Cycle { .. })));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }

        let duplicated = WorkflowDefinition::new("dup", "Dup")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::end("start"));
        match engine.register(duplicated).await {
            Err(WorkflowError::Validation(errors)) => {
                assert!(errors.contains(&ValidationError::DuplicateNode(NodeId::new("start"))));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }

        assert!(engine.list_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.execute(&WorkflowId::new("nope"), Context::new()).await,
            Err(WorkflowError::NotFound { .. })
        ));
        assert!(matches!(
            engine.get_run(RunId::new()).await,
            Err(WorkflowError::NotFound { .. })
        ));

        let err = engine.get_run_events(RunId::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_event_stream_matches_transitions() {
        let engine = engine();
        let definition = WorkflowDefinition::new("events", "Events")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::task("t", "Task", returns(json!({"done": true}))))
            .with_node(WorkflowNode::task("off", "Gated", returns(Value::Null)))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "t"))
            .with_edge(WorkflowEdge::conditional("start", "off", "false"))
            .with_edge(WorkflowEdge::new("t", "end"));
        engine.register(definition).await.unwrap();

        let run = engine
            .execute(&WorkflowId::new("events"), Context::new())
            .await
            .unwrap();
        let events = engine.get_run_events(run.id).await.unwrap();
        let kinds: Vec<String> = events
            .iter()
            .map(|e| {
                let json = serde_json::to_value(&e.event_type).unwrap();
                match e.event_type.node_id() {
                    Some(node_id) => format!("{}:{}", json["type"].as_str().unwrap(), node_id),
                    None => json["type"].as_str().unwrap().to_string(),
                }
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "run_started",
                "node_started:start",
                "node_completed:start",
                "node_started:t",
                "node_completed:t",
                // a singleton's downstream wave runs before its wave siblings
                "node_started:end",
                "node_completed:end",
                "node_skipped:off",
                "run_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_definition_registers_once() {
        let engine = engine();
        let definition = WorkflowDefinition::new("adhoc", "Adhoc")
            .with_description("run without registering first")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("start", "end"));

        let summary = engine
            .run_definition(definition.clone(), Context::new())
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        engine.run_definition(definition, Context::new()).await.unwrap();

        let workflows = engine.list_workflows().await;
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].node_count, 2);
        assert_eq!(workflows[0].description, "run without registering first");
        assert_eq!(engine.list_runs().await.len(), 2);
        assert_eq!(
            engine.get_run(summary.run_id).await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_oldest_finished_runs_are_evicted() {
        let engine = engine().with_config(EngineConfig {
            max_retained_runs: Some(2),
            ..Default::default()
        });
        engine
            .register(
                WorkflowDefinition::new("tiny", "Tiny")
                    .with_node(WorkflowNode::start("start"))
                    .with_node(WorkflowNode::end("end"))
                    .with_edge(WorkflowEdge::new("start", "end")),
            )
            .await
            .unwrap();

        let id = WorkflowId::new("tiny");
        let mut run_ids = Vec::new();
        for _ in 0..3 {
            run_ids.push(engine.execute(&id, Context::new()).await.unwrap().id);
        }

        let retained: Vec<RunId> = engine.list_runs().await.iter().map(|r| r.id).collect();
        assert_eq!(retained, run_ids[1..].to_vec());
        assert!(matches!(
            engine.get_run(run_ids[0]).await,
            Err(WorkflowError::NotFound { .. })
        ));
        assert!(engine.get_run_events(run_ids[0]).await.is_err());
        assert!(engine.event_log.get_run_events(run_ids[0]).await.unwrap().is_empty());
        assert!(!engine.get_run_events(run_ids[2]).await.unwrap().is_empty());
    }
}
