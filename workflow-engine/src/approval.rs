use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{ApprovalCancelled, EngineError, EngineResult};
use crate::workflow::{DecisionAction, WorkflowPhase};

/// What `submit_decision` delivers to the awaiting driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: DecisionAction,
    pub feedback: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(action: DecisionAction, feedback: Option<String>) -> Self {
        Self {
            action,
            feedback,
            decided_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Phase,
    Escalation,
}

/// Read-only view of a pending entry for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub workflow_id: String,
    pub phase: WorkflowPhase,
    pub kind: ApprovalKind,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    phase: WorkflowPhase,
    kind: ApprovalKind,
    content: serde_json::Value,
    created_at: DateTime<Utc>,
    resolver: oneshot::Sender<Result<Decision, ApprovalCancelled>>,
}

pub type DecisionFuture = oneshot::Receiver<Result<Decision, ApprovalCancelled>>;

/// Approval Gate - the synchronous rendezvous with the human principal.
///
/// At most one pending entry per workflow. A repeat request in the same
/// phase supersedes the previous waiter; a request while a different phase
/// is pending is a conflict. `submit_decision` resolves exactly one waiting
/// future; stray submissions fail with `NoPendingApproval`.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_approval(
        &self,
        workflow_id: &str,
        phase: WorkflowPhase,
        kind: ApprovalKind,
        content: serde_json::Value,
    ) -> EngineResult<DecisionFuture> {
        let mut pending = self.pending.lock();

        if let Some(existing) = pending.get(workflow_id) {
            if existing.phase != phase {
                return Err(EngineError::Conflict(format!(
                    "workflow {workflow_id} already waits for approval in phase {}",
                    existing.phase
                )));
            }
            // Same phase: the new request supersedes the old waiter.
            let superseded = pending.remove(workflow_id).expect("entry just observed");
            let _ = superseded.resolver.send(Err(ApprovalCancelled {
                reason: "superseded by a newer approval request".to_string(),
            }));
            warn!(workflow_id, %phase, "superseded pending approval");
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            workflow_id.to_string(),
            PendingEntry {
                phase,
                kind,
                content,
                created_at: Utc::now(),
                resolver: tx,
            },
        );
        info!(workflow_id, %phase, ?kind, "approval requested");
        Ok(rx)
    }

    /// Resolves the pending future. `expected_phase` guards against deciding
    /// a different phase than the operator saw.
    pub fn submit_decision(
        &self,
        workflow_id: &str,
        expected_phase: Option<WorkflowPhase>,
        decision: Decision,
    ) -> EngineResult<()> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get(workflow_id)
            .ok_or_else(|| EngineError::NoPendingApproval(workflow_id.to_string()))?;

        if let Some(expected) = expected_phase {
            if entry.phase != expected {
                return Err(EngineError::Conflict(format!(
                    "decision targets phase {expected} but workflow waits in {}",
                    entry.phase
                )));
            }
        }

        let entry = pending.remove(workflow_id).expect("entry just observed");
        info!(workflow_id, action = ?decision.action, "decision submitted");
        let _ = entry.resolver.send(Ok(decision));
        Ok(())
    }

    /// Resolves the waiter with a cancellation error. Returns whether an
    /// entry was actually pending.
    pub fn cancel_approval(&self, workflow_id: &str, reason: &str) -> bool {
        let Some(entry) = self.pending.lock().remove(workflow_id) else {
            return false;
        };
        let _ = entry.resolver.send(Err(ApprovalCancelled {
            reason: reason.to_string(),
        }));
        info!(workflow_id, reason, "cancelled pending approval");
        true
    }

    pub fn pending_for(&self, workflow_id: &str) -> Option<PendingApproval> {
        self.pending.lock().get(workflow_id).map(|entry| PendingApproval {
            workflow_id: workflow_id.to_string(),
            phase: entry.phase,
            kind: entry.kind,
            content: entry.content.clone(),
            created_at: entry.created_at,
        })
    }

    pub fn pending_kind(&self, workflow_id: &str) -> Option<ApprovalKind> {
        self.pending.lock().get(workflow_id).map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn decision_resolves_exactly_one_waiter() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("wf-1", WorkflowPhase::Approval, ApprovalKind::Phase, json!({}))
            .unwrap();

        gate.submit_decision(
            "wf-1",
            Some(WorkflowPhase::Approval),
            Decision::new(DecisionAction::Approve, None),
        )
        .unwrap();

        let decision = rx.await.unwrap().unwrap();
        assert_eq!(decision.action, DecisionAction::Approve);

        let err = gate
            .submit_decision("wf-1", None, Decision::new(DecisionAction::Approve, None))
            .unwrap_err();
        assert!(matches!(err, EngineError::NoPendingApproval(_)));
    }

    #[tokio::test]
    async fn same_phase_request_supersedes() {
        let gate = ApprovalGate::new();
        let first = gate
            .request_approval("wf-1", WorkflowPhase::Approval, ApprovalKind::Phase, json!(1))
            .unwrap();
        let second = gate
            .request_approval("wf-1", WorkflowPhase::Approval, ApprovalKind::Phase, json!(2))
            .unwrap();

        // The first waiter resolves with a cancellation.
        assert!(first.await.unwrap().is_err());

        gate.submit_decision("wf-1", None, Decision::new(DecisionAction::Reject, None))
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap().action, DecisionAction::Reject);
    }

    #[tokio::test]
    async fn cross_phase_request_is_conflict() {
        let gate = ApprovalGate::new();
        let _rx = gate
            .request_approval("wf-1", WorkflowPhase::Approval, ApprovalKind::Phase, json!({}))
            .unwrap();

        let err = gate
            .request_approval("wf-1", WorkflowPhase::Delivery, ApprovalKind::Phase, json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn wrong_phase_decision_is_conflict() {
        let gate = ApprovalGate::new();
        let _rx = gate
            .request_approval("wf-1", WorkflowPhase::Delivery, ApprovalKind::Phase, json!({}))
            .unwrap();

        let err = gate
            .submit_decision(
                "wf-1",
                Some(WorkflowPhase::Approval),
                Decision::new(DecisionAction::Approve, None),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        // The entry is still pending after the failed submission.
        assert!(gate.pending_for("wf-1").is_some());
    }

    #[tokio::test]
    async fn cancel_resolves_with_error() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("wf-1", WorkflowPhase::Approval, ApprovalKind::Phase, json!({}))
            .unwrap();

        assert!(gate.cancel_approval("wf-1", "workflow terminated"));
        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome.unwrap_err().reason,
            "workflow terminated".to_string()
        );
        assert!(!gate.cancel_approval("wf-1", "again"));
    }
}
