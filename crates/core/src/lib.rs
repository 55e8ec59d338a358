// Core types and functionality for the dagrun workflow engine

pub mod capability;
pub mod condition;
pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;
pub mod workflow;

pub use capability::{
    handler_fn, Capability, CapabilityRegistry, InMemoryCapabilityRegistry, TaskHandler,
};
pub use config::EngineConfig;
pub use error::{ValidationError, WorkflowError, WorkflowResult};
pub use events::{Event, EventLog, EventType, InMemoryEventLog};
pub use types::*;
pub use workflow::{
    register_workflow_capabilities, NodeHandler, WorkflowBuilder, WorkflowDefinition,
    WorkflowEdge, WorkflowEngine, WorkflowNode, WorkflowRun,
};
