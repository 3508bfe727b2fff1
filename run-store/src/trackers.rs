use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{RunStore, StoreError, StoreResult};

/// Append-only JSONL time-series under `state/`. One file per subject,
/// one sample per line; readers tolerate trailing partial lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub agent_id: String,
    pub run_id: String,
    pub status: String,
    pub duration_ms: u64,
    pub conversation_turns: u32,
    pub tokens_used: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechDebtSample {
    pub project_id: String,
    pub run_id: String,
    pub lint_errors: u32,
    pub lint_warnings: u32,
    pub tests_passed: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    store: Arc<RunStore>,
}

#[derive(Debug, Clone)]
pub struct TechDebtTracker {
    store: Arc<RunStore>,
}

impl PerformanceTracker {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn append(&self, sample: &PerformanceSample) -> StoreResult<()> {
        append_jsonl(
            self.store.state_dir().join("performance"),
            &sample.agent_id,
            sample,
        )
    }

    pub fn load_series(&self, agent_id: &str) -> StoreResult<Vec<PerformanceSample>> {
        load_jsonl(self.store.state_dir().join("performance"), agent_id)
    }
}

impl TechDebtTracker {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn append(&self, sample: &TechDebtSample) -> StoreResult<()> {
        append_jsonl(
            self.store.state_dir().join("tech-debt"),
            &sample.project_id,
            sample,
        )
    }

    pub fn load_series(&self, project_id: &str) -> StoreResult<Vec<TechDebtSample>> {
        load_jsonl(self.store.state_dir().join("tech-debt"), project_id)
    }
}

fn append_jsonl<T: Serialize>(dir: PathBuf, subject: &str, sample: &T) -> StoreResult<()> {
    fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
    let path = dir.join(format!("{subject}.jsonl"));
    let line = serde_json::to_string(sample).map_err(|e| StoreError::Serde {
        name: path.display().to_string(),
        source: e,
    })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;
    writeln!(file, "{line}").map_err(|e| StoreError::io(&path, e))?;
    Ok(())
}

fn load_jsonl<T: DeserializeOwned>(dir: PathBuf, subject: &str) -> StoreResult<Vec<T>> {
    let path = dir.join(format!("{subject}.jsonl"));
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(&path, e)),
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
