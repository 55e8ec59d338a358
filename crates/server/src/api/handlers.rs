use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dagrun_core::{
    events::Event,
    types::{Context, RunId, WorkflowId},
    workflow::{WorkflowDefinition, WorkflowRun, WorkflowSummary},
    WorkflowError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(run_id: &str) -> ApiResult<RunId> {
    run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", run_id)))
}

/// List registered workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.engine.list_workflows().await;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
}

/// Register a workflow definition
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<CreateWorkflowResponse>)> {
    let id = definition.id.clone();
    state.engine.register(definition).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateWorkflowResponse {
            message: format!("Workflow {} registered", id),
            id,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkflowResponse {
    pub id: WorkflowId,
    pub message: String,
}

/// Get a workflow definition
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let definition = state
        .engine
        .get(&workflow_id)
        .await
        .ok_or_else(|| WorkflowError::workflow_not_found(&workflow_id))?;

    Ok(Json(definition.as_ref().clone()))
}

/// Execute a workflow and wait for the run to finish
pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> ApiResult<Json<WorkflowRun>> {
    let run = state
        .engine
        .execute(&WorkflowId::new(workflow_id), req.inputs)
        .await?;

    tracing::info!("Run {} finished with status {}", run.id, run.status);
    Ok(Json(run))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub inputs: Context,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.engine.list_runs().await;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<WorkflowRun>,
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<WorkflowRun>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.engine.get_run(run_id).await?;
    Ok(Json(run))
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let events = state.engine.get_run_events(run_id).await?;
    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}
