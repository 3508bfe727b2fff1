use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use run_store::RunStore;

use crate::capabilities::Vcs;
use crate::error::{EngineError, EngineResult};
use crate::ticket::{TicketManager, TicketStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequestRecord {
    pub ticket_id: String,
    pub worker_id: String,
    pub branch: String,
    pub artifacts: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewVerdict {
    Approve { checklist: Option<String> },
    Reject { feedback: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// Review Workflow - per-subtask code review with an append-only audit log.
///
/// Every request and every decision writes exactly one `reviews.log` line.
/// Approval fires the merge hook; rejection marks the ticket
/// revision-required and hands the feedback back to the worker.
pub struct ReviewWorkflow {
    store: Arc<RunStore>,
    tickets: Arc<TicketManager>,
    vcs: Arc<dyn Vcs>,
    workspace_root: PathBuf,
    integration_branch: String,
    pending: Mutex<HashMap<String, ReviewRequestRecord>>,
}

impl std::fmt::Debug for ReviewWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewWorkflow")
            .field("pending", &self.pending.lock().len())
            .field("integration_branch", &self.integration_branch)
            .finish()
    }
}

impl ReviewWorkflow {
    pub fn new(
        store: Arc<RunStore>,
        tickets: Arc<TicketManager>,
        vcs: Arc<dyn Vcs>,
        workspace_root: PathBuf,
        integration_branch: String,
    ) -> Self {
        Self {
            store,
            tickets,
            vcs,
            workspace_root,
            integration_branch,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_review(
        &self,
        run_id: &str,
        record: ReviewRequestRecord,
    ) -> EngineResult<()> {
        self.store.append_log(
            run_id,
            "reviews.log",
            &format!(
                "[REQUEST] ticket={} worker={}",
                record.ticket_id, record.worker_id
            ),
        )?;
        info!(ticket = %record.ticket_id, worker = %record.worker_id, "review requested");
        self.pending.lock().insert(record.ticket_id.clone(), record);
        Ok(())
    }

    pub async fn submit_review(
        &self,
        run_id: &str,
        ticket_id: &str,
        reviewer_id: &str,
        verdict: ReviewVerdict,
    ) -> EngineResult<ReviewOutcome> {
        let record = self
            .pending
            .lock()
            .remove(ticket_id)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("no review request for ticket {ticket_id}"))
            })?;

        match verdict {
            ReviewVerdict::Approve { checklist } => {
                let mut line = format!("[APPROVE] ticket={ticket_id} reviewer={reviewer_id}");
                if let Some(checklist) = &checklist {
                    line.push_str(&format!(" checklist={checklist}"));
                }
                self.store.append_log(run_id, "reviews.log", &line)?;

                if let Err(e) = self.tickets.set_status(ticket_id, TicketStatus::Completed) {
                    warn!(ticket = ticket_id, error = %e, "ticket update after approve failed");
                }

                let report = self
                    .vcs
                    .merge_report(&self.workspace_root, &record.branch, &self.integration_branch)
                    .await?;
                info!(ticket = ticket_id, %report, "merge hook fired");

                Ok(ReviewOutcome {
                    approved: true,
                    feedback: checklist,
                })
            }
            ReviewVerdict::Reject { feedback } => {
                self.store.append_log(
                    run_id,
                    "reviews.log",
                    &format!(
                        "[REJECT] ticket={ticket_id} reviewer={reviewer_id} feedback={feedback}"
                    ),
                )?;
                if let Err(e) = self
                    .tickets
                    .set_status(ticket_id, TicketStatus::RevisionRequired)
                {
                    warn!(ticket = ticket_id, error = %e, "ticket update after reject failed");
                }
                Ok(ReviewOutcome {
                    approved: false,
                    feedback: Some(feedback),
                })
            }
        }
    }

    pub fn get_pending_requests(&self) -> Vec<ReviewRequestRecord> {
        let mut requests: Vec<ReviewRequestRecord> =
            self.pending.lock().values().cloned().collect();
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        requests
    }

    pub fn clear_requests(&self, ticket_id: Option<&str>) {
        let mut pending = self.pending.lock();
        match ticket_id {
            Some(id) => {
                pending.remove(id);
            }
            None => pending.clear(),
        }
    }
}
