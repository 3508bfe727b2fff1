use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use agent_bus::{AgentBus, Message, MessagePayload};
use run_store::RunStore;
use worker_pool::{WorkerType, WorkerTypeRegistry};

use crate::error::EngineResult;
use crate::workflow::{
    Proposal, RiskAssessment, RiskSeverity, TaskBreakdownItem, TaskDependency, WorkerAssignment,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingStatementRecord {
    pub agent_id: String,
    pub statement: String,
    pub spoke_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingMinutes {
    pub id: String,
    pub workflow_id: String,
    pub topic: String,
    pub participants: Vec<String>,
    pub statements: Vec<MeetingStatementRecord>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MeetingOutcome {
    pub minutes: MeetingMinutes,
    pub proposal: Proposal,
}

/// Meeting Coordinator - convenes a bounded multi-agent dialogue over the
/// bus and turns the minutes into a proposal.
///
/// Statements are addressed to the meeting id, so unrelated traffic to the
/// facilitator is never consumed. Collection stops at quorum (every invited
/// participant spoke) or when the round budget runs out.
#[derive(Debug, Clone)]
pub struct MeetingCoordinator {
    bus: AgentBus,
    store: Arc<RunStore>,
    registry: WorkerTypeRegistry,
    round_budget: usize,
    round_timeout: Duration,
}

impl MeetingCoordinator {
    pub fn new(bus: AgentBus, store: Arc<RunStore>, registry: WorkerTypeRegistry) -> Self {
        Self {
            bus,
            store,
            registry,
            round_budget: 3,
            round_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_rounds(mut self, round_budget: usize, round_timeout: Duration) -> Self {
        self.round_budget = round_budget;
        self.round_timeout = round_timeout;
        self
    }

    pub async fn convene(
        &self,
        run_id: &str,
        workflow_id: &str,
        topic: &str,
        facilitator_id: &str,
        participants: &[String],
        revision_feedback: Option<&str>,
    ) -> EngineResult<MeetingOutcome> {
        let meeting_id = format!("meeting-{}", Uuid::new_v4().simple());
        info!(workflow_id, %meeting_id, topic, "convening meeting");

        for participant in participants {
            self.bus
                .send(Message::new(
                    facilitator_id,
                    participant,
                    MessagePayload::MeetingInvite {
                        workflow_id: workflow_id.to_string(),
                        meeting_id: meeting_id.clone(),
                        topic: topic.to_string(),
                        facilitator_id: facilitator_id.to_string(),
                    },
                ))
                .await?;
        }

        let quorum = participants.len();
        let mut statements: Vec<MeetingStatementRecord> = Vec::new();
        for round in 0..self.round_budget {
            if quorum == 0 || statements.len() >= quorum {
                break;
            }
            let batch = self.bus.poll(&meeting_id, self.round_timeout).await?;
            debug!(round, received = batch.len(), "meeting round");
            for message in batch {
                if let MessagePayload::MeetingStatement {
                    meeting_id: stated_meeting,
                    statement,
                    ..
                } = message.payload
                {
                    if stated_meeting == meeting_id {
                        statements.push(MeetingStatementRecord {
                            agent_id: message.from,
                            statement,
                            spoke_at: message.timestamp,
                        });
                    }
                }
            }
        }

        let summary = if statements.is_empty() {
            format!("No statements collected on \"{topic}\"; plan derived from the instruction.")
        } else {
            format!(
                "{} statements from {} participants on \"{topic}\".",
                statements.len(),
                participants.len()
            )
        };

        let minutes = MeetingMinutes {
            id: meeting_id.clone(),
            workflow_id: workflow_id.to_string(),
            topic: topic.to_string(),
            participants: participants.to_vec(),
            statements,
            summary,
            created_at: Utc::now(),
        };
        self.store
            .save_document(run_id, &format!("{meeting_id}.json"), &minutes)?;

        let proposal = self.draft_proposal(topic, &minutes, revision_feedback);
        proposal.validate()?;
        Ok(MeetingOutcome { minutes, proposal })
    }

    /// Derives the task plan: an optional research stage when the
    /// instruction calls for one, then design, implementation and test
    /// stages chained as a linear dependency graph.
    fn draft_proposal(
        &self,
        instruction: &str,
        minutes: &MeetingMinutes,
        revision_feedback: Option<&str>,
    ) -> Proposal {
        let mut stages: Vec<(String, String, WorkerType)> = Vec::new();

        let matched = self.registry.match_by_text(instruction);
        if matched == WorkerType::Research {
            stages.push((
                "Research".to_string(),
                format!("Research the open questions behind: {instruction}"),
                WorkerType::Research,
            ));
        }
        stages.push((
            "Design".to_string(),
            format!("Design the approach for: {instruction}"),
            WorkerType::Design,
        ));
        stages.push((
            "Implement".to_string(),
            format!("Implement: {instruction}"),
            if matched == WorkerType::Research {
                WorkerType::Developer
            } else {
                matched
            },
        ));
        stages.push((
            "Test".to_string(),
            format!("Verify with tests: {instruction}"),
            WorkerType::Test,
        ));

        // Task ids are globally unique so they can double as ticket ids in
        // the shared ticket tree.
        let ids: Vec<String> = (0..stages.len())
            .map(|_| run_store::new_task_id())
            .collect();
        let task_breakdown: Vec<TaskBreakdownItem> = stages
            .iter()
            .enumerate()
            .map(|(i, (title, description, worker_type))| TaskBreakdownItem {
                id: ids[i].clone(),
                title: title.clone(),
                description: description.clone(),
                worker_type: *worker_type,
                estimated_effort: if *worker_type == WorkerType::Developer {
                    "medium".to_string()
                } else {
                    "small".to_string()
                },
                dependencies: if i == 0 {
                    vec![]
                } else {
                    vec![ids[i - 1].clone()]
                },
            })
            .collect();

        let worker_assignments = task_breakdown
            .iter()
            .map(|task| WorkerAssignment {
                task_id: task.id.clone(),
                worker_type: task.worker_type,
                rationale: format!("{} stage of the delivery pipeline", task.title.to_lowercase()),
            })
            .collect();

        let dependencies = task_breakdown
            .windows(2)
            .map(|pair| TaskDependency {
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
            })
            .collect();

        let mut risk_assessment = vec![RiskAssessment {
            description: "Generated changes may regress existing behavior".to_string(),
            severity: RiskSeverity::Medium,
            mitigation: "lint and test gates plus per-subtask review".to_string(),
        }];
        if revision_feedback.is_some() {
            risk_assessment.push(RiskAssessment {
                description: "Previous proposal was sent back for revision".to_string(),
                severity: RiskSeverity::Low,
                mitigation: "revision feedback folded into the plan".to_string(),
            });
        }

        let scope = match revision_feedback {
            Some(feedback) => format!(
                "Deliver \"{instruction}\" within the current project. Revision feedback: {feedback}"
            ),
            None => format!("Deliver \"{instruction}\" within the current project."),
        };

        Proposal {
            summary: format!("Plan for: {instruction}"),
            scope,
            task_breakdown,
            worker_assignments,
            risk_assessment,
            dependencies,
            meeting_minutes_ids: vec![minutes.id.clone()],
            extra: serde_json::Map::new(),
        }
    }
}
