// Workflow graphs and the engine that runs them

pub mod builder;
pub mod dag;
pub mod definition;
pub mod engine;
mod executor;
mod node_executor;
pub mod run;
pub mod tools;

pub use builder::WorkflowBuilder;
pub use dag::WorkflowDag;
pub use definition::{NodeHandler, WorkflowDefinition, WorkflowEdge, WorkflowNode};
pub use engine::{WorkflowEngine, WorkflowSummary};
pub use run::{NodeExecution, RunSummary, WorkflowRun};
pub use tools::register_workflow_capabilities;
