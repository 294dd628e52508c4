/// Workflow management and instance control endpoints
///
/// Thin layer over the registry and execution engine. Errors are `ApiError`s
/// and map to status codes in one place.

use crate::{
    error::{ApiError, ApiResult},
    runtime::engine::{ExecutionEngine, StepCompletion},
    workflow::{
        registry::WorkflowRegistry,
        types::{TriggerContext, TriggerEvent, Workflow, WorkflowInstance, WorkflowInstanceStep},
    },
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the acting user for operations without a body field for it
pub const USER_HEADER: &str = "x-user-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Versioned workflow definitions
    pub registry: Arc<WorkflowRegistry>,
    /// Instance lifecycle
    pub engine: Arc<ExecutionEngine>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub assignee: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(archive_workflow),
        )
        .route("/api/workflows/{id}/instances", post(instantiate))
        .route("/api/events", post(handle_event))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/steps", get(list_instance_steps))
        .route("/api/instances/{id}/steps/{step_id}/complete", post(complete_step))
        .route("/api/instances/{id}/steps/{step_id}/reject", post(reject_step))
        .route("/api/instances/{id}/steps/{step_id}/assign", post(assign_step))
        .route("/api/instances/{id}/cancel", post(cancel_instance))
        .route("/api/instances/{id}/suspend", post(suspend_instance))
        .route("/api/instances/{id}/resume", post(resume_instance))
}

pub(crate) fn acting_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// POST /api/workflows
async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(workflow): Json<Workflow>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let user = acting_user(&headers);
    let created = state.registry.create_workflow(workflow, user.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    let workflows: Vec<Workflow> = state
        .registry
        .list_workflows()
        .iter()
        .map(|w| w.as_ref().clone())
        .collect();
    Json(json!({ "workflows": workflows }))
}

/// GET /api/workflows/{id}
async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let compiled = state
        .registry
        .get_workflow(&id)
        .ok_or_else(|| ApiError::not_found("workflow", &id))?;
    Ok(Json(json!({
        "workflow": compiled.workflow.as_ref(),
        "unreachableSteps": compiled.unreachable_steps,
    })))
}

/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(workflow): Json<Workflow>,
) -> ApiResult<Json<Workflow>> {
    let user = acting_user(&headers);
    Ok(Json(
        state.registry.update_workflow(&id, workflow, user.as_deref()).await?,
    ))
}

/// DELETE /api/workflows/{id}
///
/// Definitions are archived, never removed; instances may still pin them.
async fn archive_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Workflow>> {
    let user = acting_user(&headers);
    Ok(Json(state.registry.archive_workflow(&id, user.as_deref()).await?))
}

/// POST /api/workflows/{id}/instances
async fn instantiate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(context): Json<TriggerContext>,
) -> ApiResult<(StatusCode, Json<WorkflowInstance>)> {
    let instance = state.engine.instantiate(&id, context).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// POST /api/events
async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<Json<Value>> {
    let instances = state.engine.handle_trigger(event).await?;
    Ok(Json(json!({ "instances": instances })))
}

/// GET /api/instances/{id}
async fn get_instance(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(state.engine.get_instance(id).await?))
}

/// GET /api/instances/{id}/steps
async fn list_instance_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowInstanceStep>>> {
    Ok(Json(state.engine.list_instance_steps(id).await?))
}

/// POST /api/instances/{id}/steps/{step_id}/complete
async fn complete_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(Uuid, String)>,
    Json(completion): Json<StepCompletion>,
) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(state.engine.complete_step(id, &step_id, completion).await?))
}

/// POST /api/instances/{id}/steps/{step_id}/reject
async fn reject_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(
        state
            .engine
            .reject_step(id, &step_id, request.user_id.as_deref(), &request.reason)
            .await?,
    ))
}

/// POST /api/instances/{id}/steps/{step_id}/assign
async fn assign_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(Uuid, String)>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<Json<WorkflowInstanceStep>> {
    Ok(Json(
        state
            .engine
            .assign_step(id, &step_id, &request.assignee, request.user_id.as_deref())
            .await?,
    ))
}

/// POST /api/instances/{id}/cancel
async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<WorkflowInstance>> {
    Ok(Json(
        state
            .engine
            .cancel_instance(id, request.user_id.as_deref(), request.reason.as_deref())
            .await?,
    ))
}

/// POST /api/instances/{id}/suspend
async fn suspend_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<WorkflowInstance>> {
    let user = acting_user(&headers);
    Ok(Json(state.engine.suspend_instance(id, user.as_deref()).await?))
}

/// POST /api/instances/{id}/resume
async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<WorkflowInstance>> {
    let user = acting_user(&headers);
    Ok(Json(state.engine.resume_instance(id, user.as_deref()).await?))
}
