use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod adapters;
pub mod error;
pub mod handlers;

pub use adapters::*;
pub use error::{AppError, AppResult};

use workflow_engine::WorkflowEngine;

#[derive(Debug)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

pub fn build_router(engine: Arc<WorkflowEngine>) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/health", get(handlers::health))
        .route("/workflows", post(handlers::start_workflow).get(handlers::list_workflows))
        .route("/workflows/:id", get(handlers::get_workflow))
        .route("/workflows/:id/approval", get(handlers::get_pending_approval))
        .route("/workflows/:id/decisions", post(handlers::submit_decision))
        .route("/workflows/:id/rollback", post(handlers::rollback_workflow))
        .route("/workflows/:id/escalations", post(handlers::handle_escalation))
        .route("/workflows/:id/terminate", post(handlers::terminate_workflow))
        .route("/workers", get(handlers::list_workers))
        .route("/reviews", get(handlers::list_pending_reviews))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
