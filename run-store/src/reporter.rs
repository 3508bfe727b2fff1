use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::{RunStore, StoreResult};

/// Execution Reporter - renders the final Markdown report for a run.
///
/// Section order is fixed and consumed by the dashboard as-is:
/// status, timeline, changes, quality gates, conversation summary,
/// artifacts.
#[derive(Debug, Clone)]
pub struct ExecutionReporter {
    store: Arc<RunStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub run_id: String,
    pub task_description: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub changes: Vec<ChangeEntry>,
    pub lint_passed: bool,
    pub lint_output: String,
    pub tests_passed: bool,
    pub test_output: String,
    pub conversation_summary: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub path: String,
    pub action: String,
    pub summary: String,
}

impl ExecutionReporter {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn render(report: &ExecutionReport) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# 実行レポート: {}", report.run_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "タスク: {}", report.task_description);
        let _ = writeln!(out);

        let _ = writeln!(out, "## ステータス");
        let _ = writeln!(out);
        let _ = writeln!(out, "- 結果: {}", report.status);
        let _ = writeln!(out);

        let _ = writeln!(out, "## タイムライン");
        let _ = writeln!(out);
        let _ = writeln!(out, "- 開始: {}", report.started_at.to_rfc3339());
        let _ = writeln!(out, "- 終了: {}", report.finished_at.to_rfc3339());
        let _ = writeln!(
            out,
            "- 所要時間: {}秒",
            (report.finished_at - report.started_at).num_seconds()
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "## 変更点");
        let _ = writeln!(out);
        if report.changes.is_empty() {
            let _ = writeln!(out, "変更はありません。");
        } else {
            for change in &report.changes {
                let _ = writeln!(out, "- `{}` ({}): {}", change.path, change.action, change.summary);
            }
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## 品質ゲート結果");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "- lint: {}",
            if report.lint_passed { "✅ passed" } else { "❌ failed" }
        );
        let _ = writeln!(out, "  - {}", report.lint_output);
        let _ = writeln!(
            out,
            "- test: {}",
            if report.tests_passed { "✅ passed" } else { "❌ failed" }
        );
        let _ = writeln!(out, "  - {}", report.test_output);
        let _ = writeln!(out);

        let _ = writeln!(out, "## 会話サマリー");
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", report.conversation_summary);
        let _ = writeln!(out);

        let _ = writeln!(out, "## 成果物");
        let _ = writeln!(out);
        if report.artifacts.is_empty() {
            let _ = writeln!(out, "成果物はありません。");
        } else {
            for artifact in &report.artifacts {
                let _ = writeln!(out, "- {}", artifact);
            }
        }

        out
    }

    pub fn write(&self, report: &ExecutionReport) -> StoreResult<()> {
        let rendered = Self::render(report);
        let path = self.store.run_dir(&report.run_id).join("report.md");
        std::fs::write(&path, rendered).map_err(|e| crate::StoreError::io(&path, e))?;
        info!(run_id = %report.run_id, "wrote execution report");
        Ok(())
    }
}
