use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An event in the engine's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while a run executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: WorkflowId,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },

    // Node lifecycle events, one per status transition
    NodeStarted {
        node_id: NodeId,
        node_type: NodeType,
        attempt: u32,
    },
    NodeCompleted {
        node_id: NodeId,
        node_type: NodeType,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: NodeId,
        node_type: NodeType,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    NodeRetryScheduled {
        node_id: NodeId,
        node_type: NodeType,
        retries_remaining: u32,
    },
    NodeSkipped {
        node_id: NodeId,
        node_type: NodeType,
        reason: String,
    },
}

impl EventType {
    /// Node the event belongs to, if it is a node event
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            EventType::NodeStarted { node_id, .. }
            | EventType::NodeCompleted { node_id, .. }
            | EventType::NodeFailed { node_id, .. }
            | EventType::NodeRetryScheduled { node_id, .. }
            | EventType::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Get events for a run within a time range
    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>> {
        let events = self.get_run_events(run_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }

    /// Forget the events of a run; logs that persist history may keep them
    async fn remove_run(&self, _run_id: RunId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Event log held in memory, grouped by run
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_run(&self, run_id: RunId) -> anyhow::Result<()> {
        self.events.write().await.remove(&run_id);
        Ok(())
    }
}
