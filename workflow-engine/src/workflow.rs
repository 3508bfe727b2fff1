use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use worker_pool::WorkerType;

use crate::error::{EngineError, EngineResult};
use crate::quality::GateCheck;

/// The five phases a workflow moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Proposal,
    Approval,
    Development,
    QualityAssurance,
    Delivery,
}

impl WorkflowPhase {
    pub fn order(&self) -> u8 {
        match self {
            WorkflowPhase::Proposal => 0,
            WorkflowPhase::Approval => 1,
            WorkflowPhase::Development => 2,
            WorkflowPhase::QualityAssurance => 3,
            WorkflowPhase::Delivery => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Proposal => "proposal",
            WorkflowPhase::Approval => "approval",
            WorkflowPhase::Development => "development",
            WorkflowPhase::QualityAssurance => "quality_assurance",
            WorkflowPhase::Delivery => "delivery",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingApproval,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Terminated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    RequestRevision,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecisionRecord {
    pub phase: WorkflowPhase,
    pub action: DecisionAction,
    pub feedback: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub message: String,
    pub phase: WorkflowPhase,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBreakdownItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub worker_type: WorkerType,
    pub estimated_effort: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssignment {
    pub task_id: String,
    pub worker_type: WorkerType,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub description: String,
    pub severity: RiskSeverity,
    pub mitigation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
    pub from: String,
    pub to: String,
}

/// The versioned plan emitted by the proposal phase. Immutable once written;
/// a revision produces a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub summary: String,
    pub scope: String,
    pub task_breakdown: Vec<TaskBreakdownItem>,
    pub worker_assignments: Vec<WorkerAssignment>,
    pub risk_assessment: Vec<RiskAssessment>,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    pub meeting_minutes_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Proposal {
    /// Checks every structural invariant: non-empty text and collections,
    /// dependency endpoints resolve to breakdown ids, assignments cover every
    /// task, and the dependency graph is acyclic.
    pub fn validate(&self) -> EngineResult<()> {
        if self.summary.trim().is_empty() || self.scope.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "proposal summary and scope must be non-empty".to_string(),
            ));
        }
        if self.task_breakdown.is_empty() {
            return Err(EngineError::InvalidArgument(
                "proposal task breakdown must be non-empty".to_string(),
            ));
        }
        if self.risk_assessment.is_empty() {
            return Err(EngineError::InvalidArgument(
                "proposal risk assessment must be non-empty".to_string(),
            ));
        }
        if self.meeting_minutes_ids.is_empty() {
            return Err(EngineError::InvalidArgument(
                "proposal must reference at least one meeting".to_string(),
            ));
        }

        let ids: HashSet<&str> = self.task_breakdown.iter().map(|t| t.id.as_str()).collect();
        if ids.len() != self.task_breakdown.len() {
            return Err(EngineError::InvalidArgument(
                "proposal task ids must be unique".to_string(),
            ));
        }

        for task in &self.task_breakdown {
            if !self.worker_assignments.iter().any(|a| a.task_id == task.id) {
                return Err(EngineError::InvalidArgument(format!(
                    "task {} has no worker assignment",
                    task.id
                )));
            }
        }

        for dep in &self.dependencies {
            if !ids.contains(dep.from.as_str()) || !ids.contains(dep.to.as_str()) {
                return Err(EngineError::InvalidArgument(format!(
                    "dependency {} -> {} references unknown task",
                    dep.from, dep.to
                )));
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Ids of the tasks `task_id` waits on, combining the explicit edge list
    /// with per-task dependency declarations.
    pub fn prerequisites_of(&self, task_id: &str) -> Vec<String> {
        let mut prereqs: Vec<String> = self
            .dependencies
            .iter()
            .filter(|d| d.to == task_id)
            .map(|d| d.from.clone())
            .collect();
        if let Some(task) = self.task_breakdown.iter().find(|t| t.id == task_id) {
            for dep in &task.dependencies {
                if !prereqs.contains(dep) {
                    prereqs.push(dep.clone());
                }
            }
        }
        prereqs
    }

    fn check_acyclic(&self) -> EngineResult<()> {
        // Kahn's algorithm over the union of edge sources.
        let mut indegree: HashMap<&str, usize> = self
            .task_breakdown
            .iter()
            .map(|t| (t.id.as_str(), 0))
            .collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.task_breakdown {
            for prereq in self.prerequisites_of(&task.id) {
                let Some(from) = self
                    .task_breakdown
                    .iter()
                    .find(|t| t.id == prereq)
                    .map(|t| t.id.as_str())
                else {
                    continue;
                };
                edges.entry(from).or_default().push(task.id.as_str());
                *indegree.entry(task.id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in edges.get(id).into_iter().flatten() {
                let d = indegree.get_mut(next).expect("edge endpoint tracked");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != self.task_breakdown.len() {
            return Err(EngineError::InvalidArgument(
                "proposal dependencies contain a cycle".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Assigned,
    Running,
    QualityCheck,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskProgress {
    pub id: String,
    pub worker_type: WorkerType,
    pub status: SubtaskStatus,
    pub assigned_worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub review_status: ReviewStatus,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Failures so far; survives restart as part of the workflow document.
    #[serde(default)]
    pub retry_count: u32,
    pub feedback: Option<String>,
}

impl SubtaskProgress {
    pub fn for_task(task: &TaskBreakdownItem) -> Self {
        Self {
            id: task.id.clone(),
            worker_type: task.worker_type,
            status: SubtaskStatus::Pending,
            assigned_worker_id: None,
            started_at: None,
            completed_at: None,
            review_status: ReviewStatus::Pending,
            artifacts: Vec::new(),
            retry_count: 0,
            feedback: None,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self.status, SubtaskStatus::Skipped)
            || (self.status == SubtaskStatus::Completed
                && self.review_status == ReviewStatus::Approved)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProgress {
    pub subtasks: Vec<SubtaskProgress>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
}

impl WorkflowProgress {
    pub fn from_proposal(proposal: &Proposal) -> Self {
        Self {
            subtasks: proposal
                .task_breakdown
                .iter()
                .map(SubtaskProgress::for_task)
                .collect(),
            total_tasks: proposal.task_breakdown.len() as u32,
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }

    pub fn subtask(&self, id: &str) -> Option<&SubtaskProgress> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut SubtaskProgress> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    pub fn all_satisfied(&self) -> bool {
        !self.subtasks.is_empty() && self.subtasks.iter().all(SubtaskProgress::is_satisfied)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub task_id: String,
    pub worker_type: WorkerType,
    pub failure_details: String,
    pub retry_count: u32,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityResults {
    pub lint_result: GateCheck,
    pub test_result: GateCheck,
    pub final_review_result: GateCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableChange {
    pub path: String,
    pub action: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deliverable {
    pub summary_report: String,
    pub changes: Vec<DeliverableChange>,
    pub test_results: String,
    pub review_history: Vec<String>,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Partial,
    QualityFailed,
    Error,
}

/// Result of one worker execution. Every field is required; a serialized
/// form always carries all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: String,
    pub ticket_id: String,
    pub agent_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub artifacts: Vec<String>,
    pub git_branch: String,
    pub commits: Vec<String>,
    pub quality_gates: crate::quality::QualityGateResult,
    pub errors: Vec<String>,
    pub conversation_turns: u32,
    pub tokens_used: u64,
}

/// One CEO-issued instruction flowing through the five phases. Owned by the
/// engine; mutated only by its driver task, with readers receiving deep
/// copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub workflow_id: String,
    pub run_id: String,
    pub project_id: String,
    pub instruction: String,
    pub current_phase: WorkflowPhase,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
    #[serde(default)]
    pub approval_decisions: Vec<ApprovalDecisionRecord>,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    #[serde(default)]
    pub meeting_minutes_ids: Vec<String>,
    pub proposal: Option<Proposal>,
    pub progress: Option<WorkflowProgress>,
    pub quality_results: Option<QualityResults>,
    pub deliverable: Option<Deliverable>,
    pub escalation: Option<Escalation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Workflow {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        project_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            project_id: project_id.into(),
            instruction: instruction.into(),
            current_phase: WorkflowPhase::Proposal,
            status: WorkflowStatus::Running,
            phase_history: Vec::new(),
            approval_decisions: Vec::new(),
            error_log: Vec::new(),
            meeting_minutes_ids: Vec::new(),
            proposal: None,
            progress: None,
            quality_results: None,
            deliverable: None,
            escalation: None,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    /// Appends exactly one transition entry and moves the current phase.
    /// Terminated workflows never transition again; same-phase transitions
    /// are rejected; the reason must be non-empty.
    pub fn transition_to(&mut self, to: WorkflowPhase, reason: &str) -> EngineResult<()> {
        if self.status == WorkflowStatus::Terminated {
            return Err(EngineError::Conflict(format!(
                "workflow {} is terminated",
                self.workflow_id
            )));
        }
        if reason.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "transition reason must be non-empty".to_string(),
            ));
        }
        if to == self.current_phase {
            return Err(EngineError::Conflict(format!(
                "workflow {} is already in phase {}",
                self.workflow_id, to
            )));
        }

        self.phase_history.push(PhaseTransition {
            from: self.current_phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.current_phase = to;
        self.touch();
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>, recoverable: bool) {
        self.error_log.push(ErrorLogEntry {
            message: message.into(),
            phase: self.current_phase,
            timestamp: Utc::now(),
            recoverable,
        });
        self.touch();
    }

    pub fn record_decision(&mut self, action: DecisionAction, feedback: Option<String>) {
        self.approval_decisions.push(ApprovalDecisionRecord {
            phase: self.current_phase,
            action,
            feedback,
            decided_at: Utc::now(),
        });
        self.touch();
    }

    pub fn raise_escalation(&mut self, escalation: Escalation) {
        self.escalation = Some(escalation);
        self.status = WorkflowStatus::WaitingApproval;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Last feedback recorded for a revision request, fed into the next
    /// proposal meeting.
    pub fn last_revision_feedback(&self) -> Option<&str> {
        self.approval_decisions
            .iter()
            .rev()
            .find(|d| d.action == DecisionAction::RequestRevision)
            .and_then(|d| d.feedback.as_deref())
    }

    /// Validates the phase-history chain: adjacent entries link up and the
    /// current phase matches the last entry.
    pub fn validate_chain(&self) -> EngineResult<()> {
        for pair in self.phase_history.windows(2) {
            if pair[0].to != pair[1].from {
                return Err(EngineError::Internal(format!(
                    "phase history broken between {} and {}",
                    pair[0].to, pair[1].from
                )));
            }
        }
        let expected = self
            .phase_history
            .last()
            .map(|t| t.to)
            .unwrap_or(WorkflowPhase::Proposal);
        if expected != self.current_phase {
            return Err(EngineError::Internal(format!(
                "current phase {} does not match history tail {}",
                self.current_phase, expected
            )));
        }
        Ok(())
    }
}
