// Integration tests for the workflow control surface.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use agent_bus::AgentBus;
use run_store::RunStore;
use worker_pool::{PoolConfig, WorkerPool};
use worker_runtime::InMemoryRuntime;
use workflow_engine::{
    ChatCompletion, ChatMessage, ChatOutcome, EngineConfig, EngineResult, NoopVcs, QualityGate,
    QualityGateResult, WorkflowEngine,
};

use agent_company_api::build_router;

#[derive(Debug)]
struct OkChat;

#[async_trait]
impl ChatCompletion for OkChat {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<ChatOutcome> {
        Ok(ChatOutcome {
            content: "done".to_string(),
            tokens_used: 16,
        })
    }
}

#[derive(Debug)]
struct PassGate;

#[async_trait]
impl QualityGate for PassGate {
    async fn run(&self, _workspace: &Path) -> EngineResult<QualityGateResult> {
        Ok(QualityGateResult::all_passed())
    }
}

fn test_app(root: &Path) -> Router {
    let store = Arc::new(RunStore::new(root).unwrap());
    let pool = Arc::new(WorkerPool::new(
        PoolConfig::new(3, root.join("worker-ws")),
        Arc::new(InMemoryRuntime::new()),
    ));
    let config = EngineConfig {
        ceo_agent_id: "ceo".to_string(),
        meeting_participants: Vec::new(),
        max_retries: 3,
        task_timeout: Duration::from_secs(5),
        dispatch_interval: Duration::from_millis(50),
        default_model: "llama3.2:1b".to_string(),
        integration_branch: "develop".to_string(),
    };
    let engine = Arc::new(WorkflowEngine::new(
        config,
        store,
        AgentBus::in_memory(),
        pool,
        Arc::new(PassGate),
        Arc::new(OkChat),
        Arc::new(NoopVcs),
    ));
    build_router(engine)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_state(
    app: &Router,
    workflow_id: &str,
    what: &str,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let (status, body) = send(app, "GET", &format!("/workflows/{workflow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if pred(&body["data"]) {
            return body["data"].clone();
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}: {}", body["data"]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_reports_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test_app(tmp.path());

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workflow_lifecycle_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test_app(tmp.path());

    // Start.
    let (status, body) = send(
        &app,
        "POST",
        "/workflows",
        Some(json!({ "instruction": "Implement login endpoint", "projectId": "proj-001" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let workflow_id = body["data"]["workflowId"].as_str().unwrap().to_string();
    assert!(workflow_id.starts_with("wf-"));

    // Reaches the approval gate.
    wait_for_state(&app, &workflow_id, "approval gate", |w| {
        w["currentPhase"] == "approval" && w["status"] == "waiting_approval"
    })
    .await;

    let (status, body) = send(&app, "GET", &format!("/workflows/{workflow_id}/approval"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["phase"], "approval");

    // Approve the proposal.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/workflows/{workflow_id}/decisions"),
        Some(json!({ "action": "approve", "phase": "approval" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Runs through development and quality assurance to delivery.
    wait_for_state(&app, &workflow_id, "delivery gate", |w| {
        w["currentPhase"] == "delivery" && w["status"] == "waiting_approval"
    })
    .await;

    // Final approval completes the workflow.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/workflows/{workflow_id}/decisions"),
        Some(json!({ "action": "approve", "phase": "delivery", "feedback": "ship it" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let done = wait_for_state(&app, &workflow_id, "completion", |w| {
        w["status"] == "completed"
    })
    .await;
    assert!(done["deliverable"].is_object());

    // Listing includes it, with and without the status filter.
    let (_, all) = send(&app, "GET", "/workflows", None).await;
    assert_eq!(all["data"].as_array().unwrap().len(), 1);
    let (_, completed) = send(&app, "GET", "/workflows?status=completed", None).await;
    assert_eq!(completed["data"].as_array().unwrap().len(), 1);
    let (_, running) = send(&app, "GET", "/workflows?status=running", None).await;
    assert_eq!(running["data"].as_array().unwrap().len(), 0);

    // Worker snapshot is readable.
    let (status, workers) = send(&app, "GET", "/workers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(workers["data"].is_array());

    // Every review request was decided; nothing left pending.
    let (status, reviews) = send(&app, "GET", "/reviews", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviews["data"].as_array().unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn errors_use_the_error_envelope() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test_app(tmp.path());

    // Unknown workflow.
    let (status, body) = send(&app, "GET", "/workflows/wf-missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    // Decision with nothing pending.
    let (status, body) = send(
        &app,
        "POST",
        "/workflows/wf-missing/decisions",
        Some(json!({ "action": "approve" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unknown workflow"));

    // Empty instruction.
    let (status, body) = send(
        &app,
        "POST",
        "/workflows",
        Some(json!({ "instruction": " ", "projectId": "proj-001" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rollback_and_terminate_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test_app(tmp.path());

    let (_, body) = send(
        &app,
        "POST",
        "/workflows",
        Some(json!({ "instruction": "Implement login endpoint", "projectId": "proj-001" })),
    )
    .await;
    let workflow_id = body["data"]["workflowId"].as_str().unwrap().to_string();

    wait_for_state(&app, &workflow_id, "approval gate", |w| {
        w["currentPhase"] == "approval"
    })
    .await;

    // Rollback to a non-earlier phase conflicts.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/workflows/{workflow_id}/rollback"),
        Some(json!({ "targetPhase": "delivery" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Rollback to proposal is recorded with a rollback reason.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/workflows/{workflow_id}/rollback"),
        Some(json!({ "targetPhase": "proposal" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let history = body["data"]["phaseHistory"].as_array().unwrap();
    assert!(history
        .iter()
        .any(|t| t["reason"].as_str().unwrap_or_default().contains("rollback")));

    // Terminate is absorbing.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/workflows/{workflow_id}/terminate"),
        Some(json!({ "reason": "operator stop" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_state(&app, &workflow_id, "termination", |w| {
        w["status"] == "terminated"
    })
    .await;
}
