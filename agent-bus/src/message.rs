use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One addressed message on the bus.
///
/// Wire shape: `{id, type, from, to, payload, timestamp}` - the `type` tag
/// and `payload` body come from the [`MessagePayload`] sum, flattened into
/// the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
}

/// Closed sum of message kinds. Every kind has a fixed shape; there is no
/// free-form dictionary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessagePayload {
    TaskAssign {
        workflow_id: String,
        run_id: String,
        subtask_id: String,
        title: String,
        description: String,
        worker_type: String,
        /// Review or quality-gate feedback carried into a reassignment.
        feedback: Option<String>,
    },
    TaskResult {
        workflow_id: String,
        subtask_id: String,
        worker_id: String,
        status: TaskResultStatus,
        git_branch: Option<String>,
        artifacts: Vec<String>,
        errors: Vec<String>,
        conversation_turns: u32,
        tokens_used: u64,
    },
    ReviewRequest {
        workflow_id: String,
        ticket_id: String,
        worker_id: String,
        branch: String,
        artifacts: Vec<String>,
    },
    ReviewResponse {
        workflow_id: String,
        ticket_id: String,
        reviewer_id: String,
        approved: bool,
        feedback: Option<String>,
    },
    ConflictEscalate {
        workflow_id: String,
        subtask_id: String,
        worker_type: String,
        failure_details: String,
        retry_count: u32,
    },
    MeetingInvite {
        workflow_id: String,
        meeting_id: String,
        topic: String,
        facilitator_id: String,
    },
    MeetingStatement {
        workflow_id: String,
        meeting_id: String,
        statement: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Success,
    Partial,
    QualityFailed,
    Error,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: format!("msg-{}", Uuid::new_v4().simple()),
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self.payload {
            MessagePayload::TaskAssign { .. } => "task_assign",
            MessagePayload::TaskResult { .. } => "task_result",
            MessagePayload::ReviewRequest { .. } => "review_request",
            MessagePayload::ReviewResponse { .. } => "review_response",
            MessagePayload::ConflictEscalate { .. } => "conflict_escalate",
            MessagePayload::MeetingInvite { .. } => "meeting_invite",
            MessagePayload::MeetingStatement { .. } => "meeting_statement",
        }
    }
}
