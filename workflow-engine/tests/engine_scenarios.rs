use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_bus::AgentBus;
use run_store::RunStore;
use worker_pool::{PoolConfig, WorkerPool};
use worker_runtime::InMemoryRuntime;
use workflow_engine::{
    ChatCompletion, ChatMessage, ChatOutcome, DecisionAction, EngineConfig, EngineResult,
    EscalationAction, NoopVcs, QualityGate, QualityGateResult, Workflow, WorkflowEngine,
    WorkflowPhase, WorkflowStatus,
};

#[derive(Debug)]
struct OkChat;

#[async_trait]
impl ChatCompletion for OkChat {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<ChatOutcome> {
        Ok(ChatOutcome {
            content: "implemented as requested".to_string(),
            tokens_used: 64,
        })
    }
}

/// Errors a fixed number of times, then hangs. Lets escalation tests observe
/// a stable post-decision state instead of racing the next failure.
#[derive(Debug)]
struct FailThenHangChat {
    failures_left: AtomicU32,
}

impl FailThenHangChat {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
        }
    }
}

#[async_trait]
impl ChatCompletion for FailThenHangChat {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<ChatOutcome> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("model unavailable"));
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(anyhow!("unreachable"))
    }
}

/// Hangs forever; used to freeze a workflow mid-development for the crash
/// and rollback scenarios.
#[derive(Debug)]
struct HangChat;

#[async_trait]
impl ChatCompletion for HangChat {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<ChatOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(anyhow!("unreachable"))
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

/// Passes for worker workspaces but fails the first N integration runs. The
/// integration workspace is the project root, worker workspaces are nested
/// one level deeper.
#[derive(Debug)]
struct IntegrationFlakyGate {
    project_root: std::path::PathBuf,
    integration_failures_left: AtomicU32,
}

#[async_trait]
impl QualityGate for IntegrationFlakyGate {
    async fn run(&self, workspace: &Path) -> EngineResult<QualityGateResult> {
        if workspace == self.project_root {
            let left = self.integration_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.integration_failures_left.store(left - 1, Ordering::SeqCst);
                return Ok(QualityGateResult::from_checks(
                    workflow_engine::GateCheck::failed_with(
                        "integration lint failed",
                        vec!["error: unused variable".to_string()],
                    ),
                    workflow_engine::GateCheck::failed_with("skipped (lint failed)", vec![]),
                ));
            }
        }
        Ok(QualityGateResult::all_passed())
    }
}

fn build_engine(
    root: &Path,
    chat: Arc<dyn ChatCompletion>,
    gate: Arc<dyn QualityGate>,
) -> WorkflowEngine {
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
    WorkflowEngine::new(
        config,
        store,
        AgentBus::in_memory(),
        pool,
        gate,
        chat,
        Arc::new(NoopVcs),
    )
}

async fn wait_for(
    engine: &WorkflowEngine,
    workflow_id: &str,
    timeout: Duration,
    what: &str,
    pred: impl Fn(&Workflow) -> bool,
) -> Workflow {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(state) = engine.get_workflow_state(workflow_id) {
            // Invariant 1 holds at every observable point.
            state.validate_chain().unwrap();
            if pred(&state) {
                return state;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {what}; phase={} status={:?} escalation={:?}",
                    state.current_phase, state.status, state.escalation
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}; workflow unknown");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn approve_proposal(engine: &WorkflowEngine, workflow_id: &str) {
    wait_for(engine, workflow_id, Duration::from_secs(10), "approval gate", |w| {
        w.current_phase == WorkflowPhase::Approval && w.status == WorkflowStatus::WaitingApproval
    })
    .await;
    engine
        .submit_decision(
            workflow_id,
            Some(WorkflowPhase::Approval),
            DecisionAction::Approve,
            None,
        )
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_happy_path_reaches_completed_with_report() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(tmp.path(), Arc::new(OkChat), Arc::new(PassGate));

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();

    approve_proposal(&engine, &workflow_id).await;

    let at_delivery = wait_for(
        &engine,
        &workflow_id,
        Duration::from_secs(20),
        "delivery approval",
        |w| {
            w.current_phase == WorkflowPhase::Delivery
                && w.status == WorkflowStatus::WaitingApproval
        },
    )
    .await;
    assert!(at_delivery.deliverable.is_some());

    engine
        .submit_decision(
            &workflow_id,
            Some(WorkflowPhase::Delivery),
            DecisionAction::Approve,
            Some("ship it".to_string()),
        )
        .unwrap();

    let done = wait_for(&engine, &workflow_id, Duration::from_secs(10), "completion", |w| {
        w.status == WorkflowStatus::Completed
    })
    .await;

    // Phases visited strictly in order.
    let visited: Vec<WorkflowPhase> = done.phase_history.iter().map(|t| t.to).collect();
    assert_eq!(
        visited,
        vec![
            WorkflowPhase::Approval,
            WorkflowPhase::Development,
            WorkflowPhase::QualityAssurance,
            WorkflowPhase::Delivery,
        ]
    );
    assert_eq!(done.current_phase, WorkflowPhase::Delivery);
    assert!(done.deliverable.is_some());
    assert!(done.quality_results.is_some());

    // Every subtask finished and was reviewed.
    let progress = done.progress.as_ref().unwrap();
    assert!(progress.all_satisfied());

    // The report carries every required section.
    let report_path = tmp
        .path()
        .join("runs")
        .join(&done.run_id)
        .join("report.md");
    let report = std::fs::read_to_string(report_path).unwrap();
    for section in [
        "# 実行レポート:",
        "## ステータス",
        "## タイムライン",
        "## 変更点",
        "## 品質ゲート結果",
        "## 会話サマリー",
        "## 成果物",
    ] {
        assert!(report.contains(section), "report missing section {section}");
    }
    assert!(report.contains(&done.run_id));

    // Review log has one line per request and decision.
    let store = RunStore::new(tmp.path()).unwrap();
    let review_lines = store.read_log(&done.run_id, "reviews.log").unwrap();
    let requests = review_lines.iter().filter(|l| l.contains("[REQUEST]")).count();
    let approvals = review_lines.iter().filter(|l| l.contains("[APPROVE]")).count();
    assert_eq!(requests, progress.subtasks.len());
    assert_eq!(approvals, progress.subtasks.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_request_revision_regenerates_proposal() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(tmp.path(), Arc::new(OkChat), Arc::new(PassGate));

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();

    wait_for(&engine, &workflow_id, Duration::from_secs(10), "first approval", |w| {
        w.current_phase == WorkflowPhase::Approval && w.status == WorkflowStatus::WaitingApproval
    })
    .await;

    engine
        .submit_decision(
            &workflow_id,
            Some(WorkflowPhase::Approval),
            DecisionAction::RequestRevision,
            Some("split token handling into its own task".to_string()),
        )
        .unwrap();

    let revised = wait_for(
        &engine,
        &workflow_id,
        Duration::from_secs(10),
        "second approval round",
        |w| {
            w.meeting_minutes_ids.len() == 2
                && w.current_phase == WorkflowPhase::Approval
                && w.status == WorkflowStatus::WaitingApproval
        },
    )
    .await;

    let visited: Vec<(WorkflowPhase, WorkflowPhase)> = revised
        .phase_history
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        visited,
        vec![
            (WorkflowPhase::Proposal, WorkflowPhase::Approval),
            (WorkflowPhase::Approval, WorkflowPhase::Proposal),
            (WorkflowPhase::Proposal, WorkflowPhase::Approval),
        ]
    );
    assert!(revised
        .proposal
        .as_ref()
        .unwrap()
        .scope
        .contains("split token handling"));

    engine.terminate_workflow(&workflow_id, "test cleanup").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_reject_terminates_without_development() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(tmp.path(), Arc::new(OkChat), Arc::new(PassGate));

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();

    wait_for(&engine, &workflow_id, Duration::from_secs(10), "approval gate", |w| {
        w.status == WorkflowStatus::WaitingApproval
    })
    .await;

    engine
        .submit_decision(
            &workflow_id,
            Some(WorkflowPhase::Approval),
            DecisionAction::Reject,
            Some("not a priority".to_string()),
        )
        .unwrap();

    let dead = wait_for(&engine, &workflow_id, Duration::from_secs(10), "termination", |w| {
        w.status == WorkflowStatus::Terminated
    })
    .await;

    assert!(dead
        .phase_history
        .iter()
        .all(|t| t.to != WorkflowPhase::Development));
    assert_eq!(dead.current_phase, WorkflowPhase::Approval);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_escalation_retry_resets_subtask() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(
        tmp.path(),
        Arc::new(FailThenHangChat::failing(3)),
        Arc::new(PassGate),
    );

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine, &workflow_id).await;

    let escalated = wait_for(
        &engine,
        &workflow_id,
        Duration::from_secs(20),
        "escalation",
        |w| w.escalation.is_some() && w.status == WorkflowStatus::WaitingApproval,
    )
    .await;
    let escalation = escalated.escalation.as_ref().unwrap();
    assert_eq!(escalation.retry_count, 3);
    let failed_task = escalation.task_id.clone();

    engine
        .handle_escalation(&workflow_id, EscalationAction::Retry, "give it another go")
        .await
        .unwrap();

    let resumed = engine.get_workflow_state(&workflow_id).unwrap();
    assert!(resumed.escalation.is_none());
    assert_eq!(resumed.status, WorkflowStatus::Running);
    let subtask = resumed
        .progress
        .as_ref()
        .unwrap()
        .subtask(&failed_task)
        .unwrap();
    assert_eq!(subtask.retry_count, 0);
    assert!(subtask.assigned_worker_id.is_none() || subtask.retry_count == 0);

    engine.terminate_workflow(&workflow_id, "test cleanup").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_escalation_abort_terminates_with_log_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(
        tmp.path(),
        Arc::new(FailThenHangChat::failing(3)),
        Arc::new(PassGate),
    );

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine, &workflow_id).await;

    wait_for(&engine, &workflow_id, Duration::from_secs(20), "escalation", |w| {
        w.escalation.is_some()
    })
    .await;

    engine
        .handle_escalation(&workflow_id, EscalationAction::Abort, "cannot be fixed")
        .await
        .unwrap();

    let dead = wait_for(&engine, &workflow_id, Duration::from_secs(10), "termination", |w| {
        w.status == WorkflowStatus::Terminated
    })
    .await;
    assert!(dead.escalation.is_none());
    assert!(dead
        .error_log
        .iter()
        .any(|e| e.message.contains("エスカレーション対応: abort")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_restore_resumes_from_persisted_snapshot() {
    let tmp = tempfile::tempdir().unwrap();

    // First engine: freezes mid-development because the model never answers.
    let engine1 = build_engine(tmp.path(), Arc::new(HangChat), Arc::new(PassGate));
    let workflow_id = engine1
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine1, &workflow_id).await;

    let running = wait_for(
        &engine1,
        &workflow_id,
        Duration::from_secs(10),
        "development dispatch",
        |w| {
            w.current_phase == WorkflowPhase::Development
                && w.progress
                    .as_ref()
                    .is_some_and(|p| p.subtasks.iter().any(|s| s.assigned_worker_id.is_some()))
        },
    )
    .await;
    let run_id = running.run_id.clone();

    // Simulate the crash: the first engine forgets the workflow and its
    // driver exits without further writes.
    assert!(engine1.detach_workflow(&workflow_id));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let store = RunStore::new(tmp.path()).unwrap();
    let persisted: Workflow = store
        .load_document(&run_id, "workflow.json")
        .unwrap()
        .expect("workflow snapshot on disk");
    assert_eq!(persisted.current_phase, WorkflowPhase::Development);
    persisted.validate_chain().unwrap();

    // Second engine restores from disk and finishes the job.
    let engine2 = build_engine(tmp.path(), Arc::new(OkChat), Arc::new(PassGate));
    assert_eq!(engine2.restore_workflows().await.unwrap(), 1);

    let restored = engine2.get_workflow_state(&workflow_id).unwrap();
    assert_eq!(restored.workflow_id, persisted.workflow_id);
    assert_eq!(restored.run_id, persisted.run_id);
    assert_eq!(restored.instruction, persisted.instruction);
    assert_eq!(restored.proposal, persisted.proposal);
    assert!(restored.phase_history.starts_with(&persisted.phase_history));

    wait_for(
        &engine2,
        &workflow_id,
        Duration::from_secs(20),
        "delivery after restore",
        |w| {
            w.current_phase == WorkflowPhase::Delivery
                && w.status == WorkflowStatus::WaitingApproval
        },
    )
    .await;

    engine2
        .submit_decision(
            &workflow_id,
            Some(WorkflowPhase::Delivery),
            DecisionAction::Approve,
            None,
        )
        .unwrap();
    wait_for(&engine2, &workflow_id, Duration::from_secs(10), "completion", |w| {
        w.status == WorkflowStatus::Completed
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rollback_records_single_transition_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(tmp.path(), Arc::new(HangChat), Arc::new(PassGate));

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine, &workflow_id).await;

    wait_for(&engine, &workflow_id, Duration::from_secs(10), "development", |w| {
        w.current_phase == WorkflowPhase::Development
    })
    .await;

    // Rolling forward or sideways is a conflict.
    let err = engine
        .rollback_to_phase(&workflow_id, WorkflowPhase::Development)
        .await
        .unwrap_err();
    assert!(matches!(err, workflow_engine::EngineError::Conflict(_)));

    engine
        .rollback_to_phase(&workflow_id, WorkflowPhase::Proposal)
        .await
        .unwrap();

    let state = engine.get_workflow_state(&workflow_id).unwrap();
    let rollbacks: Vec<_> = state
        .phase_history
        .iter()
        .filter(|t| t.reason.contains("rollback"))
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].to, WorkflowPhase::Proposal);

    // The driver re-runs the proposal phase and reaches approval again.
    wait_for(
        &engine,
        &workflow_id,
        Duration::from_secs(10),
        "approval after rollback",
        |w| w.meeting_minutes_ids.len() == 2 && w.current_phase == WorkflowPhase::Approval,
    )
    .await;

    engine.terminate_workflow(&workflow_id, "test cleanup").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quality_failure_reopens_latest_subtask_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let gate = Arc::new(IntegrationFlakyGate {
        project_root: tmp.path().join("workspaces").join("proj-001"),
        integration_failures_left: AtomicU32::new(1),
    });
    let engine = build_engine(tmp.path(), Arc::new(OkChat), gate);

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine, &workflow_id).await;

    let done = wait_for(
        &engine,
        &workflow_id,
        Duration::from_secs(30),
        "delivery after gate recovery",
        |w| w.current_phase == WorkflowPhase::Delivery,
    )
    .await;

    // One roundtrip back to development is recorded.
    assert!(done
        .phase_history
        .iter()
        .any(|t| t.from == WorkflowPhase::QualityAssurance
            && t.to == WorkflowPhase::Development
            && t.reason.contains("quality gate failed")));
    assert!(done.quality_results.is_some());

    engine.terminate_workflow(&workflow_id, "test cleanup").await.unwrap();
}

/// Passes in worker workspaces but errors outright at the integration
/// workspace, driving the quality phase into the internal-failure path.
#[derive(Debug)]
struct BrokenIntegrationGate {
    project_root: std::path::PathBuf,
}

#[async_trait]
impl QualityGate for BrokenIntegrationGate {
    async fn run(&self, workspace: &Path) -> EngineResult<QualityGateResult> {
        if workspace == self.project_root {
            return Err(workflow_engine::EngineError::Internal(
                "gate runner crashed".to_string(),
            ));
        }
        Ok(QualityGateResult::all_passed())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn driver_error_fails_workflow_with_log_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let gate = Arc::new(BrokenIntegrationGate {
        project_root: tmp.path().join("workspaces").join("proj-001"),
    });
    let engine = build_engine(tmp.path(), Arc::new(OkChat), gate);

    let workflow_id = engine
        .start_workflow("Implement login endpoint", "proj-001")
        .await
        .unwrap();
    approve_proposal(&engine, &workflow_id).await;

    let failed = wait_for(&engine, &workflow_id, Duration::from_secs(20), "failure", |w| {
        w.status == WorkflowStatus::Failed
    })
    .await;

    assert!(!failed.error_log.is_empty());
    let last = failed.error_log.last().unwrap();
    assert_eq!(last.phase, WorkflowPhase::QualityAssurance);
    assert!(!last.recoverable);

    // The failed state is what landed on disk as well.
    let store = RunStore::new(tmp.path()).unwrap();
    let persisted: Workflow = store
        .load_document(&failed.run_id, "workflow.json")
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, WorkflowStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_workflow_rejects_empty_input() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = build_engine(tmp.path(), Arc::new(OkChat), Arc::new(PassGate));

    assert!(engine.start_workflow("  ", "proj-001").await.is_err());
    assert!(engine.start_workflow("do things", "").await.is_err());
    assert!(engine.get_workflow_state("wf-missing").is_none());
}
