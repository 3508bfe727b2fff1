// Workflow control surface: every response wraps its payload as {data} and
// errors as {error}.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use workflow_engine::{DecisionAction, EscalationAction, WorkflowPhase, WorkflowStatus};

use crate::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub instruction: String,
    pub project_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub action: DecisionAction,
    pub feedback: Option<String>,
    pub phase: Option<WorkflowPhase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub target_phase: WorkflowPhase,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub action: EscalationAction,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    pub reason: Option<String>,
}

// POST /workflows
pub async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartWorkflowRequest>,
) -> AppResult<Json<Value>> {
    let workflow_id = state
        .engine
        .start_workflow(&payload.instruction, &payload.project_id)
        .await?;
    Ok(Json(json!({ "data": { "workflowId": workflow_id } })))
}

// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> AppResult<Json<Value>> {
    let workflows = state.engine.list_workflows(query.status);
    Ok(Json(json!({ "data": workflows })))
}

// GET /workflows/:id
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let workflow = state.engine.get_workflow_state(&id).ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "data": workflow })))
}

// GET /workflows/:id/approval
pub async fn get_pending_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    state.engine.get_workflow_state(&id).ok_or(AppError::NotFound)?;
    let pending = state.engine.approvals().pending_for(&id);
    Ok(Json(json!({ "data": pending })))
}

// POST /workflows/:id/decisions
pub async fn submit_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<DecisionRequest>,
) -> AppResult<Json<Value>> {
    state
        .engine
        .submit_decision(&id, payload.phase, payload.action, payload.feedback)?;
    Ok(Json(json!({ "data": { "accepted": true } })))
}

// POST /workflows/:id/rollback
pub async fn rollback_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RollbackRequest>,
) -> AppResult<Json<Value>> {
    state.engine.rollback_to_phase(&id, payload.target_phase).await?;
    let workflow = state.engine.get_workflow_state(&id).ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "data": workflow })))
}

// POST /workflows/:id/escalations
pub async fn handle_escalation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<EscalationRequest>,
) -> AppResult<Json<Value>> {
    state
        .engine
        .handle_escalation(&id, payload.action, &payload.reason)
        .await?;
    let workflow = state.engine.get_workflow_state(&id).ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "data": workflow })))
}

// POST /workflows/:id/terminate
pub async fn terminate_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<TerminateRequest>,
) -> AppResult<Json<Value>> {
    let reason = payload.reason.unwrap_or_else(|| "terminated by operator".to_string());
    state.engine.terminate_workflow(&id, &reason).await?;
    Ok(Json(json!({ "data": { "terminated": true } })))
}

// GET /workers
pub async fn list_workers(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let workers = state.engine.pool().snapshot().await;
    Ok(Json(json!({ "data": workers })))
}

// GET /reviews
pub async fn list_pending_reviews(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let reviews = state.engine.reviews().get_pending_requests();
    Ok(Json(json!({ "data": reviews })))
}

// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "data": { "status": "ok", "version": env!("CARGO_PKG_VERSION") } }))
}
