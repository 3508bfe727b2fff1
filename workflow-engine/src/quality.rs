use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Retries a worker gets to fix quality-gate failures before giving up with
/// `quality_failed`.
pub const MAX_QUALITY_GATE_RETRIES: u32 = 3;
/// Hard cap on conversation iterations inside one worker execution.
pub const MAX_ITERATIONS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCheck {
    pub passed: bool,
    pub output: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl GateCheck {
    pub fn passed_with(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed_with(output: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            errors,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateResult {
    pub lint: GateCheck,
    pub test: GateCheck,
    pub overall: bool,
}

impl QualityGateResult {
    pub fn all_passed() -> Self {
        Self {
            lint: GateCheck::passed_with("lint clean"),
            test: GateCheck::passed_with("tests passed"),
            overall: true,
        }
    }

    pub fn from_checks(lint: GateCheck, test: GateCheck) -> Self {
        let overall = lint.passed && test.passed;
        Self { lint, test, overall }
    }

    /// Placeholder for executions that errored before the gate could run.
    pub fn not_run() -> Self {
        Self {
            lint: GateCheck::failed_with("not run", Vec::new()),
            test: GateCheck::failed_with("not run", Vec::new()),
            overall: false,
        }
    }
}

/// Quality Gate - lint first, then tests. A lint failure short-circuits the
/// test stage, which reports itself as skipped.
#[async_trait]
pub trait QualityGate: Send + Sync + fmt::Debug {
    async fn run(&self, workspace: &Path) -> EngineResult<QualityGateResult>;
}

/// Gate that shells out to configured lint and test commands inside the
/// workspace. An empty command list makes that stage trivially pass, for
/// projects without the corresponding tooling.
#[derive(Debug, Clone)]
pub struct CommandQualityGate {
    pub lint_command: Vec<String>,
    pub test_command: Vec<String>,
    pub stage_timeout: Duration,
}

impl CommandQualityGate {
    pub fn new(lint_command: Vec<String>, test_command: Vec<String>) -> Self {
        Self {
            lint_command,
            test_command,
            stage_timeout: Duration::from_secs(300),
        }
    }

    async fn run_stage(&self, name: &str, command: &[String], workspace: &Path) -> GateCheck {
        if command.is_empty() {
            return GateCheck::passed_with(format!("no {name} command configured"));
        }

        let started = Instant::now();
        let spawned = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(workspace)
            .output();

        let outcome = tokio::time::timeout(self.stage_timeout, spawned).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let errors: Vec<String> = text
                    .lines()
                    .filter(|l| l.to_lowercase().contains("error"))
                    .map(str::to_string)
                    .collect();
                let warnings: Vec<String> = text
                    .lines()
                    .filter(|l| l.to_lowercase().contains("warning"))
                    .map(str::to_string)
                    .collect();
                GateCheck {
                    passed: output.status.success(),
                    output: text,
                    errors,
                    warnings,
                    duration_ms,
                }
            }
            Ok(Err(e)) => GateCheck {
                passed: false,
                output: format!("{name} command failed to start: {e}"),
                errors: vec![e.to_string()],
                warnings: Vec::new(),
                duration_ms,
            },
            Err(_) => GateCheck {
                passed: false,
                output: format!("{name} timed out after {}s", self.stage_timeout.as_secs()),
                errors: vec!["timeout".to_string()],
                warnings: Vec::new(),
                duration_ms,
            },
        }
    }
}

#[async_trait]
impl QualityGate for CommandQualityGate {
    async fn run(&self, workspace: &Path) -> EngineResult<QualityGateResult> {
        if !workspace.exists() {
            return Err(EngineError::InvalidArgument(format!(
                "workspace {} does not exist",
                workspace.display()
            )));
        }

        let lint = self.run_stage("lint", &self.lint_command, workspace).await;
        let test = if lint.passed {
            self.run_stage("test", &self.test_command, workspace).await
        } else {
            warn!("lint failed, skipping test stage");
            GateCheck {
                passed: false,
                output: "skipped (lint failed)".to_string(),
                errors: Vec::new(),
                warnings: Vec::new(),
                duration_ms: 0,
            }
        };

        let result = QualityGateResult::from_checks(lint, test);
        info!(overall = result.overall, "quality gate finished");
        Ok(result)
    }
}

/// Machine-readable feedback produced from a failed gate run and fed back
/// into the worker conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateFeedback {
    pub failed_gates: Vec<String>,
    pub fix_instructions: Vec<String>,
}

impl QualityGateFeedback {
    pub fn from_result(result: &QualityGateResult) -> Option<Self> {
        if result.overall {
            return None;
        }
        let mut failed_gates = Vec::new();
        let mut fix_instructions = Vec::new();

        if !result.lint.passed {
            failed_gates.push("lint".to_string());
            fix_instructions.extend(
                result
                    .lint
                    .errors
                    .iter()
                    .map(|e| format!("fix lint error: {e}")),
            );
        }
        if !result.test.passed && !result.test.output.contains("skipped") {
            failed_gates.push("test".to_string());
            fix_instructions.extend(
                result
                    .test
                    .errors
                    .iter()
                    .map(|e| format!("fix failing test: {e}")),
            );
        }
        if fix_instructions.is_empty() {
            fix_instructions.push("resolve the failed quality gates".to_string());
        }

        Some(Self {
            failed_gates,
            fix_instructions,
        })
    }

    pub fn as_prompt(&self) -> String {
        format!(
            "Quality gates failed: {}. Apply these fixes:\n{}",
            self.failed_gates.join(", "),
            self.fix_instructions.join("\n")
        )
    }
}
