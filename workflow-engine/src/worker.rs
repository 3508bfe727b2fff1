use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::{ChatCompletion, ChatMessage, Vcs};
use crate::quality::{
    QualityGate, QualityGateFeedback, QualityGateResult, MAX_ITERATIONS, MAX_QUALITY_GATE_RETRIES,
};
use crate::workflow::{ExecutionResult, ExecutionStatus};

const SYSTEM_PROMPT: &str = "You are a software engineer at an AI-run company. \
Produce the requested change for your assigned subtask. Respond with the \
complete updated content.";

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub subtask_id: String,
    pub agent_id: String,
    pub workspace: PathBuf,
    pub git_branch: String,
    /// Per-conversation-turn timeout; exceeding it fails the execution.
    pub turn_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub result: ExecutionResult,
    pub transcript: Vec<String>,
}

/// Task Worker - one worker execution: drive the model, apply the change to
/// the workspace, commit, and loop through the quality-gate feedback cycle.
///
/// Gate failures feed fix instructions back into the conversation up to
/// `MAX_QUALITY_GATE_RETRIES`; the conversation itself is capped at
/// `MAX_ITERATIONS` turns. Retry exhaustion returns `quality_failed`.
#[derive(Debug, Clone)]
pub struct TaskWorker {
    chat: Arc<dyn ChatCompletion>,
    gate: Arc<dyn QualityGate>,
    vcs: Arc<dyn Vcs>,
    model: String,
}

impl TaskWorker {
    pub fn new(
        chat: Arc<dyn ChatCompletion>,
        gate: Arc<dyn QualityGate>,
        vcs: Arc<dyn Vcs>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            chat,
            gate,
            vcs,
            model: model.into(),
        }
    }

    pub async fn execute(
        &self,
        ctx: &TaskContext,
        description: &str,
        feedback: Option<&str>,
    ) -> WorkerRun {
        let start_time = Utc::now();
        let mut transcript: Vec<String> = Vec::new();
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        let task_prompt = match feedback {
            Some(feedback) => format!("{description}\n\nPrevious attempt feedback:\n{feedback}"),
            None => description.to_string(),
        };
        messages.push(ChatMessage::user(task_prompt.clone()));
        transcript.push(format!("user: {task_prompt}"));

        let mut turns: u32 = 0;
        let mut tokens_used: u64 = 0;
        let mut gate_retries: u32 = 0;
        let mut errors: Vec<String> = Vec::new();
        let mut commits: Vec<String> = Vec::new();
        let mut artifacts: Vec<String> = Vec::new();
        let mut quality_gates = QualityGateResult::not_run();

        if let Err(e) = std::fs::create_dir_all(&ctx.workspace) {
            errors.push(format!("workspace setup failed: {e}"));
            return self.finish(ctx, start_time, ExecutionStatus::Error, artifacts, commits, quality_gates, errors, turns, tokens_used, transcript);
        }
        if let Err(e) = self.vcs.create_branch(&ctx.workspace, &ctx.git_branch).await {
            errors.push(format!("branch creation failed: {e}"));
            return self.finish(ctx, start_time, ExecutionStatus::Error, artifacts, commits, quality_gates, errors, turns, tokens_used, transcript);
        }

        let status = loop {
            if turns >= MAX_ITERATIONS {
                errors.push(format!("iteration cap ({MAX_ITERATIONS}) reached"));
                break ExecutionStatus::Partial;
            }
            turns += 1;

            let outcome =
                match tokio::time::timeout(ctx.turn_timeout, self.chat.complete(&self.model, &messages))
                    .await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        errors.push(format!("chat completion failed: {e}"));
                        break ExecutionStatus::Error;
                    }
                    Err(_) => {
                        // CodingAgentTimeoutError: counts as one failure
                        // toward the dispatcher's retry budget.
                        errors.push(format!(
                            "coding agent timed out after {}s",
                            ctx.turn_timeout.as_secs()
                        ));
                        break ExecutionStatus::Error;
                    }
                };

            tokens_used += outcome.tokens_used;
            transcript.push(format!("assistant: {}", outcome.content));
            messages.push(ChatMessage::assistant(outcome.content.clone()));

            let artifact_path = ctx.workspace.join(format!("{}.generated.md", ctx.subtask_id));
            if let Err(e) = std::fs::write(&artifact_path, &outcome.content) {
                errors.push(format!("artifact write failed: {e}"));
                break ExecutionStatus::Error;
            }
            let artifact_name = artifact_path.display().to_string();
            if !artifacts.contains(&artifact_name) {
                artifacts.push(artifact_name);
            }

            match self
                .vcs
                .commit(&ctx.workspace, &format!("{}: turn {}", ctx.subtask_id, turns))
                .await
            {
                Ok(commit_id) => commits.push(commit_id),
                Err(e) => warn!(subtask = %ctx.subtask_id, error = %e, "commit failed"),
            }

            match self.gate.run(&ctx.workspace).await {
                Ok(result) => {
                    let passed = result.overall;
                    quality_gates = result;
                    if passed {
                        break ExecutionStatus::Success;
                    }
                    gate_retries += 1;
                    if gate_retries >= MAX_QUALITY_GATE_RETRIES {
                        errors.push(format!(
                            "quality gates still failing after {MAX_QUALITY_GATE_RETRIES} retries"
                        ));
                        break ExecutionStatus::QualityFailed;
                    }
                    if let Some(feedback) = QualityGateFeedback::from_result(&quality_gates) {
                        let prompt = feedback.as_prompt();
                        debug!(subtask = %ctx.subtask_id, retry = gate_retries, "gate feedback");
                        transcript.push(format!("user: {prompt}"));
                        messages.push(ChatMessage::user(prompt));
                    }
                }
                Err(e) => {
                    errors.push(format!("quality gate error: {e}"));
                    break ExecutionStatus::Error;
                }
            }
        };

        self.finish(ctx, start_time, status, artifacts, commits, quality_gates, errors, turns, tokens_used, transcript)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: &TaskContext,
        start_time: chrono::DateTime<Utc>,
        status: ExecutionStatus,
        artifacts: Vec<String>,
        commits: Vec<String>,
        quality_gates: QualityGateResult,
        errors: Vec<String>,
        conversation_turns: u32,
        tokens_used: u64,
        transcript: Vec<String>,
    ) -> WorkerRun {
        info!(
            subtask = %ctx.subtask_id,
            agent = %ctx.agent_id,
            ?status,
            turns = conversation_turns,
            "worker execution finished"
        );
        WorkerRun {
            result: ExecutionResult {
                run_id: ctx.run_id.clone(),
                ticket_id: ctx.subtask_id.clone(),
                agent_id: ctx.agent_id.clone(),
                status,
                start_time,
                end_time: Utc::now(),
                artifacts,
                git_branch: ctx.git_branch.clone(),
                commits,
                quality_gates,
                errors,
                conversation_turns,
                tokens_used,
            },
            transcript,
        }
    }
}
