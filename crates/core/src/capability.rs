// Capability bridge between TASK nodes and the work they delegate to

use crate::error::{WorkflowError, WorkflowResult};
use crate::types::Context;
use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// In-process body of a TASK node
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task against a snapshot of the run context
    async fn call(&self, context: Context) -> Result<Value>;
}

/// Externally named unit of work a TASK node can delegate to
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    /// Invoke with the merged context and node config
    async fn invoke(&self, params: Context) -> Result<Value>;
}

/// Lookup of capabilities by name
pub trait CapabilityRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>>;
}

/// Adapts an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    func: F,
}

#[async_trait::async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, context: Context) -> Result<Value> {
        (self.func)(context).await
    }
}

/// Wrap an async closure as a shareable task handler
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

/// Adapts an async closure into a [`Capability`]
pub struct FnCapability {
    func: Box<dyn Fn(Context) -> BoxFuture<'static, Result<Value>> + Send + Sync>,
}

impl FnCapability {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            func: Box::new(move |params| Box::pin(func(params))),
        }
    }
}

#[async_trait::async_trait]
impl Capability for FnCapability {
    async fn invoke(&self, params: Context) -> Result<Value> {
        (self.func)(params).await
    }
}

/// Capability registry backed by a map
pub struct InMemoryCapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<dyn Capability>>>,
}

impl InMemoryCapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
        }
    }

    /// Register a capability, replacing any previous one with the same name
    pub fn register(&self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        let name = name.into();
        tracing::info!("Registered capability: {}", name);
        self.write().insert(name, capability);
    }

    /// Register an async closure as a capability
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnCapability::new(func)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    // A poisoned lock only means a writer panicked mid-insert; the map is still usable.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Capability>>> {
        self.capabilities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Capability>>> {
        self.capabilities.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryCapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry for InMemoryCapabilityRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.read().get(name).cloned()
    }
}

/// Parameters for a named capability call: the context overlaid with node config
pub fn capability_params(context: &Context, config: &Context) -> Context {
    let mut params = context.clone();
    for (key, value) in config {
        params.insert(key.clone(), value.clone());
    }
    params
}

/// Merge a task result into the run context if it is a key/value map
pub fn merge_result(context: &mut Context, result: &Value) -> bool {
    match result {
        Value::Object(map) => {
            for (key, value) in map {
                context.insert(key.clone(), value.clone());
            }
            true
        }
        _ => false,
    }
}

/// Run the body of a TASK node through its handler
pub async fn invoke_task(
    node: &crate::workflow::WorkflowNode,
    context: Context,
    registry: &dyn CapabilityRegistry,
) -> WorkflowResult<Value> {
    use crate::workflow::NodeHandler;

    let result = match &node.handler {
        Some(NodeHandler::InProcess(handler)) => handler.call(context).await,
        Some(NodeHandler::Capability(name)) => {
            let capability = registry.resolve(name).ok_or_else(|| {
                WorkflowError::node_execution(&node.id, format!("Capability '{}' not found", name))
            })?;
            let params = capability_params(&context, &node.config);
            tracing::debug!("Invoking capability {} for node {}", name, node.id);
            capability.invoke(params).await
        }
        None => {
            return Err(WorkflowError::node_execution(
                &node.id,
                "Task node has no handler",
            ))
        }
    };

    result.map_err(|e| WorkflowError::node_execution(&node.id, format!("{:#}", e)))
}
