use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use agent_bus::{AgentBus, Message, MessagePayload, TaskResultStatus};
use run_store::{
    new_run_id, new_workflow_id, ExecutionReport, ExecutionReporter, ExecutionState,
    PerformanceSample, PerformanceTracker, RunStore, RunTaskMetadata, StateManager,
    TechDebtSample, TechDebtTracker,
};
use settings_manager::SystemConfig;
use uuid::Uuid;
use worker_pool::{WorkerPool, WorkerType, WorkerTypeRegistry};

use crate::approval::{ApprovalGate, ApprovalKind, Decision, DecisionFuture};
use crate::capabilities::{ChatCompletion, ChatMessage, Vcs};
use crate::error::{EngineError, EngineResult};
use crate::quality::{GateCheck, QualityGate};
use crate::review::{ReviewRequestRecord, ReviewVerdict, ReviewWorkflow};
use crate::ticket::{TicketManager, TicketStatus};
use crate::worker::{TaskContext, TaskWorker};
use crate::workflow::{
    DecisionAction, Deliverable, DeliverableChange, Escalation, ExecutionStatus, QualityResults,
    SubtaskStatus, ReviewStatus, Workflow, WorkflowPhase, WorkflowProgress, WorkflowStatus,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ceo_agent_id: String,
    pub meeting_participants: Vec<String>,
    pub max_retries: u32,
    pub task_timeout: Duration,
    pub dispatch_interval: Duration,
    pub default_model: String,
    pub integration_branch: String,
}

impl EngineConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            ceo_agent_id: "ceo".to_string(),
            meeting_participants: vec!["manager".to_string(), "architect".to_string()],
            max_retries: 3,
            task_timeout: Duration::from_secs(config.default_timeout),
            dispatch_interval: Duration::from_millis(250),
            default_model: config.default_model.clone(),
            integration_branch: config.integration_branch.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted { workflow_id: String },
    PhaseChanged { workflow_id: String, from: WorkflowPhase, to: WorkflowPhase },
    ApprovalRequested { workflow_id: String, phase: WorkflowPhase },
    DecisionRecorded { workflow_id: String, action: DecisionAction },
    EscalationRaised { workflow_id: String, task_id: String },
    SubtaskStateChanged { workflow_id: String, subtask_id: String, status: SubtaskStatus },
    WorkflowCompleted { workflow_id: String },
    WorkflowTerminated { workflow_id: String, reason: String },
    WorkflowFailed { workflow_id: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub run_id: String,
    pub project_id: String,
    pub instruction: String,
    pub current_phase: WorkflowPhase,
    pub status: WorkflowStatus,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Retry,
    Skip,
    Abort,
}

#[derive(Clone)]
struct WorkflowHandle {
    state: Arc<RwLock<Workflow>>,
    terminate: Arc<AtomicBool>,
}

impl WorkflowHandle {
    fn new(workflow: Workflow) -> Self {
        let terminated = workflow.status == WorkflowStatus::Terminated;
        Self {
            state: Arc::new(RwLock::new(workflow)),
            terminate: Arc::new(AtomicBool::new(terminated)),
        }
    }
}

/// Workflow Engine - the state machine driving every workflow through
/// proposal, approval, development, quality assurance and delivery.
///
/// Each workflow is owned by a single driver task; public reads hand out
/// deep-copied snapshots. The driver suspends only at bus polls, approval
/// awaits, container lifecycle operations, quality-gate runs and store
/// writes, and checks its termination flag when resuming. Every transition
/// is persisted before the driver moves on, so a crash never leaves a
/// half-applied transition on disk.
pub struct WorkflowEngine {
    config: EngineConfig,
    store: Arc<RunStore>,
    state_manager: StateManager,
    bus: AgentBus,
    pool: Arc<WorkerPool>,
    registry: WorkerTypeRegistry,
    approvals: Arc<ApprovalGate>,
    reviews: Arc<ReviewWorkflow>,
    tickets: Arc<TicketManager>,
    meetings: crate::meeting::MeetingCoordinator,
    quality: Arc<dyn QualityGate>,
    chat: Arc<dyn ChatCompletion>,
    vcs: Arc<dyn Vcs>,
    performance: PerformanceTracker,
    tech_debt: TechDebtTracker,
    workflows: Arc<DashMap<String, WorkflowHandle>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflows.len())
            .finish()
    }
}

impl Clone for WorkflowEngine {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            state_manager: self.state_manager.clone(),
            bus: self.bus.clone(),
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            approvals: self.approvals.clone(),
            reviews: self.reviews.clone(),
            tickets: self.tickets.clone(),
            meetings: self.meetings.clone(),
            quality: self.quality.clone(),
            chat: self.chat.clone(),
            vcs: self.vcs.clone(),
            performance: self.performance.clone(),
            tech_debt: self.tech_debt.clone(),
            workflows: self.workflows.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<RunStore>,
        bus: AgentBus,
        pool: Arc<WorkerPool>,
        quality: Arc<dyn QualityGate>,
        chat: Arc<dyn ChatCompletion>,
        vcs: Arc<dyn Vcs>,
    ) -> Self {
        let registry = WorkerTypeRegistry::default();
        let tickets = Arc::new(TicketManager::new());
        let reviews = Arc::new(ReviewWorkflow::new(
            store.clone(),
            tickets.clone(),
            vcs.clone(),
            store.workspaces_dir(),
            config.integration_branch.clone(),
        ));
        let meetings =
            crate::meeting::MeetingCoordinator::new(bus.clone(), store.clone(), registry.clone());
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            state_manager: StateManager::new(store.clone()),
            performance: PerformanceTracker::new(store.clone()),
            tech_debt: TechDebtTracker::new(store.clone()),
            config,
            store,
            bus,
            pool,
            registry,
            approvals: Arc::new(ApprovalGate::new()),
            reviews,
            tickets,
            meetings,
            quality,
            chat,
            vcs,
            workflows: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn reviews(&self) -> &ReviewWorkflow {
        &self.reviews
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    // ----- public operations ------------------------------------------------

    pub async fn start_workflow(
        &self,
        instruction: &str,
        project_id: &str,
    ) -> EngineResult<String> {
        if instruction.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "instruction must be non-empty".to_string(),
            ));
        }
        if project_id.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "projectId must be non-empty".to_string(),
            ));
        }

        let workflow_id = new_workflow_id();
        let run_id = new_run_id();
        self.store.create_run_dir(&run_id)?;
        self.store.save_task_metadata(
            &run_id,
            &RunTaskMetadata {
                run_id: run_id.clone(),
                workflow_id: workflow_id.clone(),
                project_id: project_id.to_string(),
                instruction: instruction.to_string(),
                created_at: Utc::now(),
                extra: serde_json::Map::new(),
            },
        )?;

        let workflow = Workflow::new(&workflow_id, &run_id, project_id, instruction);
        self.store
            .save_document(&run_id, "workflow.json", &workflow)?;

        self.workflows
            .insert(workflow_id.clone(), WorkflowHandle::new(workflow));

        let engine = self.clone();
        let spawned_id = workflow_id.clone();
        tokio::spawn(async move { engine.drive(spawned_id).await });

        self.emit(EngineEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
        });
        info!(workflow_id, run_id, project_id, "workflow started");
        Ok(workflow_id)
    }

    pub fn get_workflow_state(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows
            .get(workflow_id)
            .map(|handle| handle.state.read().clone())
    }

    pub fn list_workflows(&self, status_filter: Option<WorkflowStatus>) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .iter()
            .map(|entry| {
                let wf = entry.value().state.read();
                WorkflowSummary {
                    workflow_id: wf.workflow_id.clone(),
                    run_id: wf.run_id.clone(),
                    project_id: wf.project_id.clone(),
                    instruction: wf.instruction.clone(),
                    current_phase: wf.current_phase,
                    status: wf.status,
                    created_at: wf.created_at,
                    updated_at: wf.updated_at,
                }
            })
            .filter(|s| status_filter.map_or(true, |f| s.status == f))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn rollback_to_phase(
        &self,
        workflow_id: &str,
        target: WorkflowPhase,
    ) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;

        let from = {
            let mut wf = handle.state.write();
            if wf.status.is_terminal() {
                return Err(EngineError::Conflict(format!(
                    "workflow {workflow_id} is {:?} and cannot roll back",
                    wf.status
                )));
            }
            if target.order() >= wf.current_phase.order() {
                return Err(EngineError::Conflict(format!(
                    "rollback target {target} is not earlier than {}",
                    wf.current_phase
                )));
            }
            let from = wf.current_phase;
            wf.transition_to(target, &format!("rollback to {target} requested by principal"))?;
            wf.status = WorkflowStatus::Running;
            wf.escalation = None;
            from
        };

        self.persist(workflow_id)?;
        // Wake a driver parked on an approval so it re-reads the phase.
        self.approvals.cancel_approval(workflow_id, "rollback");
        self.emit(EngineEvent::PhaseChanged {
            workflow_id: workflow_id.to_string(),
            from,
            to: target,
        });
        info!(workflow_id, %target, "workflow rolled back");
        Ok(())
    }

    pub fn submit_decision(
        &self,
        workflow_id: &str,
        expected_phase: Option<WorkflowPhase>,
        action: DecisionAction,
        feedback: Option<String>,
    ) -> EngineResult<()> {
        self.handle(workflow_id)?;
        if self.approvals.pending_kind(workflow_id) == Some(ApprovalKind::Escalation) {
            return Err(EngineError::Conflict(format!(
                "workflow {workflow_id} waits on an escalation, not a phase approval"
            )));
        }
        self.approvals
            .submit_decision(workflow_id, expected_phase, Decision::new(action, feedback))
    }

    pub async fn handle_escalation(
        &self,
        workflow_id: &str,
        action: EscalationAction,
        reason: &str,
    ) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;

        {
            let mut wf = handle.state.write();
            let escalation = wf
                .escalation
                .clone()
                .ok_or_else(|| {
                    EngineError::Conflict(format!("workflow {workflow_id} has no active escalation"))
                })?;

            match action {
                EscalationAction::Retry => {
                    if let Some(progress) = wf.progress.as_mut() {
                        if let Some(subtask) = progress.subtask_mut(&escalation.task_id) {
                            subtask.status = SubtaskStatus::Pending;
                            subtask.assigned_worker_id = None;
                            subtask.retry_count = 0;
                            subtask.feedback = Some(format!("escalation retry: {reason}"));
                        }
                        progress.failed_tasks = progress.failed_tasks.saturating_sub(1);
                    }
                    wf.escalation = None;
                    wf.status = WorkflowStatus::Running;
                }
                EscalationAction::Skip => {
                    if let Some(progress) = wf.progress.as_mut() {
                        if let Some(subtask) = progress.subtask_mut(&escalation.task_id) {
                            subtask.status = SubtaskStatus::Skipped;
                            subtask.completed_at = Some(Utc::now());
                            subtask.feedback = Some(format!("escalation skip: {reason}"));
                        }
                    }
                    wf.escalation = None;
                    wf.status = WorkflowStatus::Running;
                }
                EscalationAction::Abort => {
                    wf.record_error("エスカレーション対応: abort", false);
                    wf.escalation = None;
                    wf.status = WorkflowStatus::Terminated;
                    handle.terminate.store(true, Ordering::SeqCst);
                }
            }
            wf.touch();
        }

        self.persist(workflow_id)?;

        // Resolve the pending escalation entry so the parked driver resumes.
        let decision_action = match action {
            EscalationAction::Abort => DecisionAction::Reject,
            _ => DecisionAction::Approve,
        };
        match self.approvals.submit_decision(
            workflow_id,
            None,
            Decision::new(decision_action, Some(reason.to_string())),
        ) {
            Ok(()) => {}
            Err(EngineError::NoPendingApproval(_)) => {
                // Restored process without a re-registered waiter; state is
                // already updated, the driver will pick it up.
            }
            Err(e) => return Err(e),
        }

        info!(workflow_id, ?action, "escalation handled");
        Ok(())
    }

    pub async fn terminate_workflow(&self, workflow_id: &str, reason: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        {
            let mut wf = handle.state.write();
            if wf.status == WorkflowStatus::Terminated {
                return Ok(());
            }
            wf.status = WorkflowStatus::Terminated;
            wf.escalation = None;
            wf.record_error(format!("terminated: {reason}"), false);
        }
        handle.terminate.store(true, Ordering::SeqCst);
        self.approvals.cancel_approval(workflow_id, "workflow terminated");
        self.persist(workflow_id)?;
        self.emit(EngineEvent::WorkflowTerminated {
            workflow_id: workflow_id.to_string(),
            reason: reason.to_string(),
        });
        info!(workflow_id, reason, "workflow terminated");
        Ok(())
    }

    /// Reloads every workflow from the run root. Non-terminal workflows get
    /// a fresh driver that continues from the persisted snapshot.
    pub async fn restore_workflows(&self) -> EngineResult<usize> {
        let mut restored = 0;
        for run_id in self.store.list_runs()? {
            let Some(workflow) = self
                .store
                .load_document::<Workflow>(&run_id, "workflow.json")?
            else {
                continue;
            };
            let workflow_id = workflow.workflow_id.clone();
            if self.workflows.contains_key(&workflow_id) {
                continue;
            }

            let resume = !workflow.status.is_terminal();
            self.workflows
                .insert(workflow_id.clone(), WorkflowHandle::new(workflow));
            restored += 1;

            if resume {
                let engine = self.clone();
                let spawned_id = workflow_id.clone();
                tokio::spawn(async move { engine.drive(spawned_id).await });
                info!(workflow_id, "restored workflow driver");
            }
        }
        Ok(restored)
    }

    // ----- driver -----------------------------------------------------------

    async fn drive(self, workflow_id: String) {
        if let Err(e) = self.drive_phases(&workflow_id).await {
            // A termination racing a phase step surfaces as a transition
            // conflict; that is a clean exit, not a failure.
            let terminated = self
                .handle(&workflow_id)
                .map(|h| h.terminate.load(Ordering::SeqCst))
                .unwrap_or(true);
            if terminated {
                debug!(workflow_id, "driver exited after termination");
                return;
            }
            self.fail_workflow(&workflow_id, e);
        }
    }

    async fn drive_phases(&self, workflow_id: &str) -> EngineResult<()> {
        loop {
            let handle = self.handle(workflow_id)?;
            if handle.terminate.load(Ordering::SeqCst) {
                self.persist(workflow_id)?;
                debug!(workflow_id, "driver observed termination flag");
                return Ok(());
            }

            let (phase, status) = {
                let wf = handle.state.read();
                (wf.current_phase, wf.status)
            };
            if status.is_terminal() {
                self.persist(workflow_id)?;
                return Ok(());
            }

            match phase {
                WorkflowPhase::Proposal => self.run_proposal_phase(workflow_id).await?,
                WorkflowPhase::Approval => self.run_approval_phase(workflow_id).await?,
                WorkflowPhase::Development => self.run_development_phase(workflow_id).await?,
                WorkflowPhase::QualityAssurance => self.run_quality_phase(workflow_id).await?,
                WorkflowPhase::Delivery => self.run_delivery_phase(workflow_id).await?,
            }
        }
    }

    fn fail_workflow(&self, workflow_id: &str, err: EngineError) {
        error!(workflow_id, error = %err, "workflow driver failed");
        if let Ok(handle) = self.handle(workflow_id) {
            {
                let mut wf = handle.state.write();
                if wf.status.is_terminal() {
                    return;
                }
                wf.record_error(err.to_string(), false);
                wf.status = WorkflowStatus::Failed;
            }
            let _ = self.persist(workflow_id);
        }
        self.emit(EngineEvent::WorkflowFailed {
            workflow_id: workflow_id.to_string(),
            message: err.to_string(),
        });
    }

    async fn run_proposal_phase(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let (run_id, instruction, feedback, prior_versions) = {
            let wf = handle.state.read();
            (
                wf.run_id.clone(),
                wf.instruction.clone(),
                wf.last_revision_feedback().map(str::to_string),
                wf.meeting_minutes_ids.len(),
            )
        };

        let outcome = self
            .meetings
            .convene(
                &run_id,
                workflow_id,
                &instruction,
                &self.config.ceo_agent_id,
                &self.config.meeting_participants,
                feedback.as_deref(),
            )
            .await?;

        // Proposals are immutable: a revision archives the previous version
        // before the new one takes its place.
        if prior_versions > 0 {
            if let Some(previous) = self
                .store
                .load_document::<serde_json::Value>(&run_id, "proposal.json")?
            {
                self.store.save_document(
                    &run_id,
                    &format!("proposal-v{prior_versions}.json"),
                    &previous,
                )?;
            }
        }
        self.store
            .save_document(&run_id, "proposal.json", &outcome.proposal)?;

        self.build_tickets(&instruction, &outcome.proposal)?;

        let from = {
            let mut wf = handle.state.write();
            wf.meeting_minutes_ids.push(outcome.minutes.id.clone());
            wf.proposal = Some(outcome.proposal.clone());
            wf.progress = None;
            let from = wf.current_phase;
            wf.transition_to(WorkflowPhase::Approval, "proposal drafted for approval")?;
            wf.status = WorkflowStatus::WaitingApproval;
            from
        };
        self.persist(workflow_id)?;
        self.emit(EngineEvent::PhaseChanged {
            workflow_id: workflow_id.to_string(),
            from,
            to: WorkflowPhase::Approval,
        });
        Ok(())
    }

    fn build_tickets(&self, instruction: &str, proposal: &crate::workflow::Proposal) -> EngineResult<()> {
        let new_tasks: Vec<_> = proposal
            .task_breakdown
            .iter()
            .filter(|t| self.tickets.get(&t.id).is_none())
            .collect();
        if new_tasks.is_empty() {
            return Ok(());
        }

        let parent = self.tickets.create_parent(instruction);
        for task in new_tasks {
            self.tickets
                .create_child_with_id(&parent, &task.id, &task.title)?;
            self.tickets
                .create_grandchild(&task.id, format!("{} execution", task.title))?;
        }
        Ok(())
    }

    async fn run_approval_phase(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let proposal = {
            let mut wf = handle.state.write();
            wf.status = WorkflowStatus::WaitingApproval;
            wf.proposal.clone().ok_or_else(|| {
                EngineError::Internal("approval phase reached without a proposal".to_string())
            })?
        };
        self.persist(workflow_id)?;

        let rx = match self.approvals.request_approval(
            workflow_id,
            WorkflowPhase::Approval,
            ApprovalKind::Phase,
            serde_json::to_value(&proposal).unwrap_or_default(),
        ) {
            Ok(rx) => rx,
            Err(EngineError::Conflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.emit(EngineEvent::ApprovalRequested {
            workflow_id: workflow_id.to_string(),
            phase: WorkflowPhase::Approval,
        });

        let Some(decision) = Self::await_decision(rx).await else {
            // Cancelled (terminate / rollback / superseded): the outer loop
            // re-reads the state and decides what happens next.
            return Ok(());
        };

        let (from, to) = {
            let mut wf = handle.state.write();
            wf.record_decision(decision.action, decision.feedback.clone());
            let from = wf.current_phase;
            match decision.action {
                DecisionAction::Approve => {
                    wf.transition_to(WorkflowPhase::Development, "proposal approved by principal")?;
                    wf.status = WorkflowStatus::Running;
                    (from, Some(WorkflowPhase::Development))
                }
                DecisionAction::RequestRevision => {
                    wf.transition_to(WorkflowPhase::Proposal, "proposal revision requested")?;
                    wf.status = WorkflowStatus::Running;
                    (from, Some(WorkflowPhase::Proposal))
                }
                DecisionAction::Reject => {
                    wf.status = WorkflowStatus::Terminated;
                    (from, None)
                }
            }
        };
        if to.is_none() {
            let handle = self.handle(workflow_id)?;
            handle.terminate.store(true, Ordering::SeqCst);
        }

        self.persist(workflow_id)?;
        self.emit(EngineEvent::DecisionRecorded {
            workflow_id: workflow_id.to_string(),
            action: decision.action,
        });
        if let Some(to) = to {
            self.emit(EngineEvent::PhaseChanged {
                workflow_id: workflow_id.to_string(),
                from,
                to,
            });
        }
        Ok(())
    }

    async fn await_decision(rx: DecisionFuture) -> Option<Decision> {
        match rx.await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(cancelled)) => {
                debug!(reason = %cancelled.reason, "approval await cancelled");
                None
            }
            Err(_) => None,
        }
    }

    // ----- development ------------------------------------------------------

    async fn run_development_phase(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let live_workers: std::collections::HashSet<String> = self
            .pool
            .snapshot()
            .await
            .into_iter()
            .map(|w| w.id)
            .collect();

        let (run_id, project_id) = {
            let mut wf = handle.state.write();
            if wf.progress.is_none() {
                let proposal = wf.proposal.clone().ok_or_else(|| {
                    EngineError::Internal("development phase reached without a proposal".to_string())
                })?;
                wf.progress = Some(WorkflowProgress::from_proposal(&proposal));
            }
            // A restored snapshot can carry assignments from a previous
            // process; workers that no longer exist give their subtasks back.
            if let Some(progress) = wf.progress.as_mut() {
                for subtask in progress.subtasks.iter_mut() {
                    let orphaned = matches!(
                        subtask.status,
                        SubtaskStatus::Assigned | SubtaskStatus::Running
                    ) && subtask
                        .assigned_worker_id
                        .as_ref()
                        .map_or(true, |w| !live_workers.contains(w));
                    if orphaned {
                        subtask.status = SubtaskStatus::Pending;
                        subtask.assigned_worker_id = None;
                    }
                }
            }
            wf.status = if wf.escalation.is_some() {
                WorkflowStatus::WaitingApproval
            } else {
                WorkflowStatus::Running
            };
            (wf.run_id.clone(), wf.project_id.clone())
        };
        self.persist(workflow_id)?;

        let dispatcher_id = format!("engine-{workflow_id}");

        loop {
            let handle = self.handle(workflow_id)?;
            if handle.terminate.load(Ordering::SeqCst) {
                self.persist(workflow_id)?;
                return Ok(());
            }
            {
                let wf = handle.state.read();
                if wf.current_phase != WorkflowPhase::Development || wf.status.is_terminal() {
                    return Ok(());
                }
            }

            // Re-raised from persisted state after a crash, or freshly set by
            // the retry bookkeeping below.
            let pending_escalation = { handle.state.read().escalation.clone() };
            if let Some(escalation) = pending_escalation {
                self.await_escalation(workflow_id, &escalation).await?;
                continue;
            }

            if { handle.state.read().progress.as_ref().is_some_and(WorkflowProgress::all_satisfied) } {
                let from = {
                    let mut wf = handle.state.write();
                    let from = wf.current_phase;
                    wf.transition_to(
                        WorkflowPhase::QualityAssurance,
                        "all subtasks completed or skipped",
                    )?;
                    from
                };
                self.persist(workflow_id)?;
                self.emit(EngineEvent::PhaseChanged {
                    workflow_id: workflow_id.to_string(),
                    from,
                    to: WorkflowPhase::QualityAssurance,
                });
                return Ok(());
            }

            self.dispatch_ready_subtasks(workflow_id, &run_id, &project_id, &dispatcher_id)
                .await?;

            let batch = self
                .bus
                .poll(&dispatcher_id, self.config.dispatch_interval)
                .await?;
            for message in batch {
                self.process_dispatcher_message(workflow_id, &run_id, message)
                    .await?;
            }

            for dead_worker in self.pool.check_stalled().await? {
                let mut wf = handle.state.write();
                if let Some(progress) = wf.progress.as_mut() {
                    for subtask in progress.subtasks.iter_mut() {
                        if subtask.assigned_worker_id.as_deref() == Some(dead_worker.as_str())
                            && matches!(
                                subtask.status,
                                SubtaskStatus::Assigned | SubtaskStatus::Running
                            )
                        {
                            warn!(subtask = %subtask.id, worker = %dead_worker, "reassigning after stall");
                            subtask.status = SubtaskStatus::Pending;
                            subtask.assigned_worker_id = None;
                            subtask.feedback = Some("previous worker stalled".to_string());
                        }
                    }
                }
            }

            self.persist(workflow_id)?;
            self.save_execution_snapshot(workflow_id, &run_id)?;
        }
    }

    async fn dispatch_ready_subtasks(
        &self,
        workflow_id: &str,
        run_id: &str,
        project_id: &str,
        dispatcher_id: &str,
    ) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;

        let ready: Vec<(String, WorkerType, String, Option<String>)> = {
            let wf = handle.state.read();
            let Some(proposal) = wf.proposal.as_ref() else {
                return Ok(());
            };
            let Some(progress) = wf.progress.as_ref() else {
                return Ok(());
            };

            progress
                .subtasks
                .iter()
                .filter(|s| s.status == SubtaskStatus::Pending)
                .filter(|s| {
                    proposal.prerequisites_of(&s.id).iter().all(|dep| {
                        progress.subtask(dep).is_some_and(|d| {
                            matches!(d.status, SubtaskStatus::Completed | SubtaskStatus::Skipped)
                        })
                    })
                })
                .map(|s| {
                    let description = proposal
                        .task_breakdown
                        .iter()
                        .find(|t| t.id == s.id)
                        .map(|t| t.description.clone())
                        .unwrap_or_else(|| s.id.clone());
                    (s.id.clone(), s.worker_type, description, s.feedback.clone())
                })
                .collect()
        };

        for (subtask_id, worker_type, description, feedback) in ready {
            let Some(worker_id) = self.pool.acquire_by_type(worker_type).await? else {
                // Pool exhausted: defer and retry on the next loop turn.
                debug!(workflow_id, %subtask_id, "worker pool exhausted, deferring");
                break;
            };

            let git_branch = format!("feature/{subtask_id}");
            {
                let mut wf = handle.state.write();
                if let Some(subtask) = wf.progress.as_mut().and_then(|p| p.subtask_mut(&subtask_id))
                {
                    subtask.status = SubtaskStatus::Assigned;
                    subtask.assigned_worker_id = Some(worker_id.clone());
                }
            }
            let _ = self.tickets.set_status(&subtask_id, TicketStatus::InProgress);

            self.bus
                .send(Message::new(
                    dispatcher_id,
                    &worker_id,
                    MessagePayload::TaskAssign {
                        workflow_id: workflow_id.to_string(),
                        run_id: run_id.to_string(),
                        subtask_id: subtask_id.clone(),
                        title: subtask_id.clone(),
                        description: description.clone(),
                        worker_type: worker_type.as_str().to_string(),
                        feedback: feedback.clone(),
                    },
                ))
                .await?;

            {
                let mut wf = handle.state.write();
                if let Some(subtask) = wf.progress.as_mut().and_then(|p| p.subtask_mut(&subtask_id))
                {
                    subtask.status = SubtaskStatus::Running;
                    subtask.started_at = Some(Utc::now());
                }
            }
            self.emit(EngineEvent::SubtaskStateChanged {
                workflow_id: workflow_id.to_string(),
                subtask_id: subtask_id.clone(),
                status: SubtaskStatus::Running,
            });

            self.spawn_worker_execution(
                workflow_id,
                run_id,
                project_id,
                &worker_id,
                dispatcher_id,
                git_branch,
            );
        }
        Ok(())
    }

    /// The worker side of a dispatch: receives its assignment off the bus,
    /// runs the conversation + quality-gate loop, persists the execution
    /// report, and answers with a `task_result` message.
    fn spawn_worker_execution(
        &self,
        workflow_id: &str,
        run_id: &str,
        project_id: &str,
        worker_id: &str,
        dispatcher_id: &str,
        git_branch: String,
    ) {
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        let run_id = run_id.to_string();
        let project_id = project_id.to_string();
        let worker_id = worker_id.to_string();
        let dispatcher_id = dispatcher_id.to_string();

        tokio::spawn(async move {
            let assignment = engine
                .bus
                .poll(&worker_id, Duration::from_secs(5))
                .await
                .ok()
                .into_iter()
                .flatten()
                .find_map(|m| match m.payload {
                    MessagePayload::TaskAssign {
                        subtask_id,
                        description,
                        feedback,
                        ..
                    } => Some((subtask_id, description, feedback)),
                    _ => None,
                });

            let Some((subtask_id, description, feedback)) = assignment else {
                warn!(worker = %worker_id, "worker received no assignment");
                return;
            };

            let ctx = TaskContext {
                run_id: run_id.clone(),
                subtask_id: subtask_id.clone(),
                agent_id: worker_id.clone(),
                workspace: engine
                    .store
                    .workspace_dir(&project_id)
                    .join(&subtask_id),
                git_branch,
                turn_timeout: engine.config.task_timeout,
            };
            let task_worker = TaskWorker::new(
                engine.chat.clone(),
                engine.quality.clone(),
                engine.vcs.clone(),
                engine.config.default_model.clone(),
            );
            let run = task_worker.execute(&ctx, &description, feedback.as_deref()).await;

            if let Err(e) = engine
                .store
                .save_document(&run_id, &format!("reports/{subtask_id}.json"), &run.result)
            {
                warn!(error = %e, "failed to persist execution result");
            }
            for line in &run.transcript {
                let _ = engine
                    .store
                    .append_log(&run_id, "agent.log", &format!("[{worker_id}] {line}"));
            }
            let duration_ms = (run.result.end_time - run.result.start_time)
                .num_milliseconds()
                .max(0) as u64;
            let _ = engine.performance.append(&PerformanceSample {
                agent_id: worker_id.clone(),
                run_id: run_id.clone(),
                status: format!("{:?}", run.result.status).to_lowercase(),
                duration_ms,
                conversation_turns: run.result.conversation_turns,
                tokens_used: run.result.tokens_used,
                recorded_at: Utc::now(),
            });

            let status = match run.result.status {
                ExecutionStatus::Success => TaskResultStatus::Success,
                ExecutionStatus::Partial => TaskResultStatus::Partial,
                ExecutionStatus::QualityFailed => TaskResultStatus::QualityFailed,
                ExecutionStatus::Error => TaskResultStatus::Error,
            };
            let _ = engine
                .bus
                .send(Message::new(
                    &worker_id,
                    &dispatcher_id,
                    MessagePayload::TaskResult {
                        workflow_id,
                        subtask_id,
                        worker_id: worker_id.clone(),
                        status,
                        git_branch: Some(run.result.git_branch.clone()),
                        artifacts: run.result.artifacts.clone(),
                        errors: run.result.errors.clone(),
                        conversation_turns: run.result.conversation_turns,
                        tokens_used: run.result.tokens_used,
                    },
                ))
                .await;
        });
    }

    async fn process_dispatcher_message(
        &self,
        workflow_id: &str,
        run_id: &str,
        message: Message,
    ) -> EngineResult<()> {
        match message.payload {
            MessagePayload::TaskResult {
                subtask_id,
                worker_id,
                status,
                git_branch,
                artifacts,
                errors,
                ..
            } => {
                self.on_task_result(
                    workflow_id,
                    run_id,
                    &subtask_id,
                    &worker_id,
                    status,
                    git_branch,
                    artifacts,
                    errors,
                )
                .await
            }
            MessagePayload::ReviewResponse {
                ticket_id,
                approved,
                feedback,
                ..
            } => {
                self.on_review_response(workflow_id, &ticket_id, approved, feedback);
                Ok(())
            }
            other => {
                debug!(kind = ?other, "dispatcher ignoring message");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_task_result(
        &self,
        workflow_id: &str,
        run_id: &str,
        subtask_id: &str,
        worker_id: &str,
        status: TaskResultStatus,
        git_branch: Option<String>,
        artifacts: Vec<String>,
        errors: Vec<String>,
    ) -> EngineResult<()> {
        match self.pool.release(worker_id).await {
            Ok(()) => {}
            Err(worker_pool::PoolError::UnknownWorker(_)) => {}
            Err(e) => warn!(worker = worker_id, error = %e, "worker release failed"),
        }

        let handle = self.handle(workflow_id)?;

        if status == TaskResultStatus::Success {
            {
                let mut wf = handle.state.write();
                if let Some(subtask) = wf.progress.as_mut().and_then(|p| p.subtask_mut(subtask_id))
                {
                    subtask.status = SubtaskStatus::Completed;
                    subtask.completed_at = Some(Utc::now());
                    subtask.review_status = ReviewStatus::Pending;
                    subtask.artifacts = artifacts.clone();
                    subtask.feedback = None;
                }
                if let Some(progress) = wf.progress.as_mut() {
                    progress.completed_tasks = progress
                        .subtasks
                        .iter()
                        .filter(|s| s.status == SubtaskStatus::Completed)
                        .count() as u32;
                }
            }
            self.emit(EngineEvent::SubtaskStateChanged {
                workflow_id: workflow_id.to_string(),
                subtask_id: subtask_id.to_string(),
                status: SubtaskStatus::Completed,
            });

            let branch = git_branch.unwrap_or_else(|| format!("feature/{subtask_id}"));
            self.reviews.request_review(
                run_id,
                ReviewRequestRecord {
                    ticket_id: subtask_id.to_string(),
                    worker_id: worker_id.to_string(),
                    branch: branch.clone(),
                    artifacts: artifacts.clone(),
                    requested_at: Utc::now(),
                },
            )?;

            let reviewer_id = format!("review-{}", Uuid::new_v4().simple());
            self.bus
                .send(Message::new(
                    format!("engine-{workflow_id}"),
                    &reviewer_id,
                    MessagePayload::ReviewRequest {
                        workflow_id: workflow_id.to_string(),
                        ticket_id: subtask_id.to_string(),
                        worker_id: worker_id.to_string(),
                        branch,
                        artifacts,
                    },
                ))
                .await?;
            self.spawn_reviewer(workflow_id, run_id, reviewer_id);
            return Ok(());
        }

        // Failure path: count the attempt, retry or escalate.
        let escalated = {
            let mut wf = handle.state.write();
            let max_retries = self.config.max_retries;
            let mut escalated = None;
            if let Some(progress) = wf.progress.as_mut() {
                if let Some(subtask) = progress.subtask_mut(subtask_id) {
                    subtask.retry_count += 1;
                    subtask.assigned_worker_id = None;
                    let detail = if errors.is_empty() {
                        format!("task failed with status {status:?}")
                    } else {
                        errors.join("; ")
                    };
                    subtask.feedback = Some(detail.clone());

                    if subtask.retry_count >= max_retries {
                        subtask.status = SubtaskStatus::Failed;
                        let worker_type = subtask.worker_type;
                        let retry_count = subtask.retry_count;
                        progress.failed_tasks += 1;
                        escalated = Some(Escalation {
                            task_id: subtask_id.to_string(),
                            worker_type,
                            failure_details: detail,
                            retry_count,
                            raised_at: Utc::now(),
                        });
                    } else {
                        subtask.status = SubtaskStatus::Pending;
                    }
                }
            }
            if let Some(escalation) = escalated.clone() {
                wf.raise_escalation(escalation);
            }
            escalated
        };

        let _ = self.tickets.set_status(subtask_id, TicketStatus::Blocked);

        if let Some(escalation) = escalated {
            self.emit(EngineEvent::EscalationRaised {
                workflow_id: workflow_id.to_string(),
                task_id: escalation.task_id.clone(),
            });
            // Notify the principal's inbox as well; the blocking rendezvous
            // itself goes through the approval gate.
            self.bus
                .send(Message::new(
                    format!("engine-{workflow_id}"),
                    &self.config.ceo_agent_id,
                    MessagePayload::ConflictEscalate {
                        workflow_id: workflow_id.to_string(),
                        subtask_id: subtask_id.to_string(),
                        worker_type: escalation.worker_type.as_str().to_string(),
                        failure_details: escalation.failure_details.clone(),
                        retry_count: escalation.retry_count,
                    },
                ))
                .await?;
            warn!(workflow_id, subtask_id, "subtask escalated after retry exhaustion");
        }
        self.persist(workflow_id)?;
        Ok(())
    }

    /// A lightweight review agent: receives its request off the bus,
    /// consults the chat capability for a verdict, records it through the
    /// review workflow, and reports back to the dispatcher.
    fn spawn_reviewer(&self, workflow_id: &str, run_id: &str, reviewer_id: String) {
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        let run_id = run_id.to_string();
        let dispatcher_id = format!("engine-{workflow_id}");

        tokio::spawn(async move {
            let request = engine
                .bus
                .poll(&reviewer_id, Duration::from_secs(5))
                .await
                .ok()
                .into_iter()
                .flatten()
                .find_map(|m| match m.payload {
                    MessagePayload::ReviewRequest {
                        ticket_id,
                        branch,
                        artifacts,
                        ..
                    } => Some((ticket_id, branch, artifacts)),
                    _ => None,
                });

            let Some((subtask_id, branch, artifacts)) = request else {
                warn!(reviewer = %reviewer_id, "reviewer received no request");
                return;
            };

            let prompt = format!(
                "Review branch {branch} for subtask {subtask_id}. Artifacts: {}. \
                 Answer APPROVE, or REJECT followed by actionable feedback.",
                artifacts.join(", ")
            );
            let verdict = match engine
                .chat
                .complete(
                    &engine.config.default_model,
                    &[
                        ChatMessage::system("You are a strict code reviewer."),
                        ChatMessage::user(prompt),
                    ],
                )
                .await
            {
                Ok(outcome) if outcome.content.to_uppercase().contains("REJECT") => {
                    ReviewVerdict::Reject {
                        feedback: outcome.content,
                    }
                }
                Ok(_) => ReviewVerdict::Approve { checklist: None },
                Err(e) => {
                    warn!(error = %e, "review chat failed, approving by policy");
                    ReviewVerdict::Approve { checklist: None }
                }
            };

            let outcome = engine
                .reviews
                .submit_review(&run_id, &subtask_id, &reviewer_id, verdict)
                .await;
            let (approved, feedback) = match outcome {
                Ok(outcome) => (outcome.approved, outcome.feedback),
                Err(e) => {
                    warn!(error = %e, "review submission failed");
                    return;
                }
            };

            let _ = engine
                .bus
                .send(Message::new(
                    &reviewer_id,
                    &dispatcher_id,
                    MessagePayload::ReviewResponse {
                        workflow_id,
                        ticket_id: subtask_id,
                        reviewer_id: reviewer_id.clone(),
                        approved,
                        feedback,
                    },
                ))
                .await;
        });
    }

    fn on_review_response(
        &self,
        workflow_id: &str,
        subtask_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) {
        let Ok(handle) = self.handle(workflow_id) else {
            return;
        };
        let mut wf = handle.state.write();
        let Some(subtask) = wf.progress.as_mut().and_then(|p| p.subtask_mut(subtask_id)) else {
            return;
        };

        if approved {
            subtask.review_status = ReviewStatus::Approved;
        } else {
            // Back to the ready set once its dependencies still hold.
            subtask.review_status = ReviewStatus::Rejected;
            subtask.status = SubtaskStatus::Pending;
            subtask.assigned_worker_id = None;
            subtask.completed_at = None;
            subtask.feedback = feedback;
        }
    }

    async fn await_escalation(
        &self,
        workflow_id: &str,
        escalation: &Escalation,
    ) -> EngineResult<()> {
        let rx = match self.approvals.request_approval(
            workflow_id,
            WorkflowPhase::Development,
            ApprovalKind::Escalation,
            serde_json::to_value(escalation).unwrap_or_default(),
        ) {
            Ok(rx) => rx,
            Err(EngineError::Conflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.emit(EngineEvent::ApprovalRequested {
            workflow_id: workflow_id.to_string(),
            phase: WorkflowPhase::Development,
        });
        info!(workflow_id, task = %escalation.task_id, "awaiting escalation decision");

        // `handle_escalation` mutates the workflow before resolving this
        // future; the decision itself carries nothing further.
        let _ = Self::await_decision(rx).await;
        Ok(())
    }

    fn save_execution_snapshot(&self, workflow_id: &str, run_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let mut snapshot = ExecutionState::new(run_id);
        {
            let wf = handle.state.read();
            if let Some(progress) = wf.progress.as_ref() {
                for subtask in &progress.subtasks {
                    if let Some(worker) = &subtask.assigned_worker_id {
                        snapshot
                            .worker_assignments
                            .insert(subtask.id.clone(), worker.clone());
                    }
                    snapshot
                        .git_branches
                        .insert(subtask.id.clone(), format!("feature/{}", subtask.id));
                    snapshot
                        .retry_counts
                        .insert(subtask.id.clone(), subtask.retry_count);
                }
            }
        }
        self.state_manager.save_state(&snapshot)?;
        Ok(())
    }

    // ----- quality assurance ------------------------------------------------

    async fn run_quality_phase(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let (run_id, project_id) = {
            let wf = handle.state.read();
            (wf.run_id.clone(), wf.project_id.clone())
        };

        let workspace = self.store.workspace_dir(&project_id);
        std::fs::create_dir_all(&workspace)
            .map_err(|e| EngineError::Internal(format!("workspace setup: {e}")))?;

        let gate_result = self.quality.run(&workspace).await?;

        let final_review = {
            let wf = handle.state.read();
            let (approved, total) = wf
                .progress
                .as_ref()
                .map(|p| {
                    let approved = p
                        .subtasks
                        .iter()
                        .filter(|s| {
                            s.review_status == ReviewStatus::Approved
                                || s.status == SubtaskStatus::Skipped
                        })
                        .count();
                    (approved, p.subtasks.len())
                })
                .unwrap_or((0, 0));
            GateCheck {
                passed: total > 0 && approved == total,
                output: format!("{approved}/{total} subtask reviews approved"),
                errors: Vec::new(),
                warnings: Vec::new(),
                duration_ms: 0,
            }
        };

        let _ = self.tech_debt.append(&TechDebtSample {
            project_id: project_id.clone(),
            run_id: run_id.clone(),
            lint_errors: gate_result.lint.errors.len() as u32,
            lint_warnings: gate_result.lint.warnings.len() as u32,
            tests_passed: gate_result.test.passed,
            recorded_at: Utc::now(),
        });

        let overall = gate_result.overall && final_review.passed;
        {
            let mut wf = handle.state.write();
            wf.quality_results = Some(QualityResults {
                lint_result: gate_result.lint.clone(),
                test_result: gate_result.test.clone(),
                final_review_result: final_review.clone(),
            });
        }

        if overall {
            let from = {
                let mut wf = handle.state.write();
                let from = wf.current_phase;
                wf.transition_to(WorkflowPhase::Delivery, "quality gates passed")?;
                from
            };
            self.persist(workflow_id)?;
            self.emit(EngineEvent::PhaseChanged {
                workflow_id: workflow_id.to_string(),
                from,
                to: WorkflowPhase::Delivery,
            });
            return Ok(());
        }

        // Feedback loop: re-open the most recently completed subtask and go
        // back to development with the gate output attached.
        let gate_feedback = crate::quality::QualityGateFeedback::from_result(&gate_result)
            .map(|f| f.as_prompt())
            .unwrap_or_else(|| "final review incomplete".to_string());
        let reopened = self.reopen_latest_subtask(workflow_id, &gate_feedback)?;

        if !reopened {
            let mut wf = handle.state.write();
            wf.record_error(
                "quality gate failed with no completed subtask to re-open",
                false,
            );
            wf.status = WorkflowStatus::Failed;
            drop(wf);
            self.persist(workflow_id)?;
            return Ok(());
        }

        let from = {
            let mut wf = handle.state.write();
            let from = wf.current_phase;
            wf.transition_to(WorkflowPhase::Development, "quality gate failed")?;
            wf.status = WorkflowStatus::Running;
            from
        };
        self.persist(workflow_id)?;
        self.emit(EngineEvent::PhaseChanged {
            workflow_id: workflow_id.to_string(),
            from,
            to: WorkflowPhase::Development,
        });
        Ok(())
    }

    /// Re-open policy for gate failures: the most recently completed subtask
    /// goes back to pending with the failure feedback attached.
    fn reopen_latest_subtask(&self, workflow_id: &str, feedback: &str) -> EngineResult<bool> {
        let handle = self.handle(workflow_id)?;
        let mut wf = handle.state.write();
        let Some(progress) = wf.progress.as_mut() else {
            return Ok(false);
        };

        let latest = progress
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .max_by_key(|s| s.completed_at)
            .map(|s| s.id.clone());

        let Some(subtask_id) = latest else {
            return Ok(false);
        };
        if let Some(subtask) = progress.subtask_mut(&subtask_id) {
            subtask.status = SubtaskStatus::Pending;
            subtask.review_status = ReviewStatus::Pending;
            subtask.assigned_worker_id = None;
            subtask.completed_at = None;
            subtask.feedback = Some(feedback.to_string());
        }
        info!(workflow_id, subtask = %subtask_id, "re-opened subtask after gate failure");
        Ok(true)
    }

    // ----- delivery ---------------------------------------------------------

    async fn run_delivery_phase(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let (run_id, project_id) = {
            let wf = handle.state.read();
            (wf.run_id.clone(), wf.project_id.clone())
        };

        let deliverable = self.build_deliverable(workflow_id, &run_id)?;
        {
            let mut wf = handle.state.write();
            wf.deliverable = Some(deliverable.clone());
            wf.status = WorkflowStatus::WaitingApproval;
        }
        self.persist(workflow_id)?;

        let rx = match self.approvals.request_approval(
            workflow_id,
            WorkflowPhase::Delivery,
            ApprovalKind::Phase,
            serde_json::to_value(&deliverable).unwrap_or_default(),
        ) {
            Ok(rx) => rx,
            Err(EngineError::Conflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.emit(EngineEvent::ApprovalRequested {
            workflow_id: workflow_id.to_string(),
            phase: WorkflowPhase::Delivery,
        });

        let Some(decision) = Self::await_decision(rx).await else {
            return Ok(());
        };

        {
            let mut wf = handle.state.write();
            wf.record_decision(decision.action, decision.feedback.clone());
        }
        self.emit(EngineEvent::DecisionRecorded {
            workflow_id: workflow_id.to_string(),
            action: decision.action,
        });

        match decision.action {
            DecisionAction::Approve => {
                let workspace = self.store.workspace_dir(&project_id);
                match self
                    .vcs
                    .merge_report(&workspace, &self.config.integration_branch, "main")
                    .await
                {
                    Ok(report) => info!(workflow_id, %report, "delivery merge hook fired"),
                    Err(e) => warn!(workflow_id, error = %e, "delivery merge hook failed"),
                }

                {
                    let mut wf = handle.state.write();
                    wf.status = WorkflowStatus::Completed;
                }
                self.write_final_report(workflow_id, &run_id)?;
                self.persist(workflow_id)?;
                self.emit(EngineEvent::WorkflowCompleted {
                    workflow_id: workflow_id.to_string(),
                });
                info!(workflow_id, "workflow completed");
            }
            DecisionAction::RequestRevision => {
                let feedback = decision
                    .feedback
                    .clone()
                    .unwrap_or_else(|| "revision requested at delivery".to_string());
                self.reopen_latest_subtask(workflow_id, &feedback)?;
                let from = {
                    let mut wf = handle.state.write();
                    let from = wf.current_phase;
                    wf.transition_to(WorkflowPhase::Development, "revision requested at delivery")?;
                    wf.status = WorkflowStatus::Running;
                    from
                };
                self.persist(workflow_id)?;
                self.emit(EngineEvent::PhaseChanged {
                    workflow_id: workflow_id.to_string(),
                    from,
                    to: WorkflowPhase::Development,
                });
            }
            DecisionAction::Reject => {
                {
                    let mut wf = handle.state.write();
                    wf.status = WorkflowStatus::Terminated;
                }
                handle.terminate.store(true, Ordering::SeqCst);
                self.persist(workflow_id)?;
                self.emit(EngineEvent::WorkflowTerminated {
                    workflow_id: workflow_id.to_string(),
                    reason: "rejected at delivery".to_string(),
                });
            }
        }
        Ok(())
    }

    fn build_deliverable(&self, workflow_id: &str, run_id: &str) -> EngineResult<Deliverable> {
        let handle = self.handle(workflow_id)?;
        let wf = handle.state.read();

        let changes: Vec<DeliverableChange> = wf
            .progress
            .as_ref()
            .map(|p| {
                p.subtasks
                    .iter()
                    .flat_map(|s| {
                        s.artifacts.iter().map(move |a| DeliverableChange {
                            path: a.clone(),
                            action: "created".to_string(),
                            summary: format!("produced by subtask {}", s.id),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let test_results = wf
            .quality_results
            .as_ref()
            .map(|q| q.test_result.output.clone())
            .unwrap_or_else(|| "no quality results recorded".to_string());

        let review_history = self.store.read_log(run_id, "reviews.log")?;
        let artifacts = changes.iter().map(|c| c.path.clone()).collect();

        Ok(Deliverable {
            summary_report: format!(
                "Instruction \"{}\" delivered across {} subtasks.",
                wf.instruction,
                wf.progress.as_ref().map(|p| p.subtasks.len()).unwrap_or(0)
            ),
            changes,
            test_results,
            review_history,
            artifacts,
        })
    }

    fn write_final_report(&self, workflow_id: &str, run_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let wf = handle.state.read();

        let (lint_passed, lint_output, tests_passed, test_output) = wf
            .quality_results
            .as_ref()
            .map(|q| {
                (
                    q.lint_result.passed,
                    q.lint_result.output.clone(),
                    q.test_result.passed,
                    q.test_result.output.clone(),
                )
            })
            .unwrap_or((false, "not run".to_string(), false, "not run".to_string()));

        let changes = wf
            .deliverable
            .as_ref()
            .map(|d| {
                d.changes
                    .iter()
                    .map(|c| run_store::ChangeEntry {
                        path: c.path.clone(),
                        action: c.action.clone(),
                        summary: c.summary.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let report = ExecutionReport {
            run_id: run_id.to_string(),
            task_description: wf.instruction.clone(),
            status: "completed".to_string(),
            started_at: wf.created_at,
            finished_at: Utc::now(),
            changes,
            lint_passed,
            lint_output,
            tests_passed,
            test_output,
            conversation_summary: format!(
                "{} meetings, {} approval decisions, {} subtasks",
                wf.meeting_minutes_ids.len(),
                wf.approval_decisions.len(),
                wf.progress.as_ref().map(|p| p.subtasks.len()).unwrap_or(0)
            ),
            artifacts: wf
                .deliverable
                .as_ref()
                .map(|d| d.artifacts.clone())
                .unwrap_or_default(),
        };
        ExecutionReporter::new(self.store.clone()).write(&report)?;
        Ok(())
    }

    /// Forgets the in-memory handle without touching the on-disk state. The
    /// driver exits on its next iteration; another engine instance can pick
    /// the workflow up via `restore_workflows`.
    pub fn detach_workflow(&self, workflow_id: &str) -> bool {
        self.workflows.remove(workflow_id).is_some()
    }

    // ----- shared helpers ---------------------------------------------------

    fn handle(&self, workflow_id: &str) -> EngineResult<WorkflowHandle> {
        self.workflows
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("unknown workflow {workflow_id}"))
            })
    }

    fn persist(&self, workflow_id: &str) -> EngineResult<()> {
        let handle = self.handle(workflow_id)?;
        let snapshot = handle.state.read().clone();
        self.store
            .save_document(&snapshot.run_id, "workflow.json", &snapshot)?;
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}
