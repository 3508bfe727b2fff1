use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{RunStore, StoreResult};

const STATE_DOCUMENT: &str = "execution_state.json";

/// Snapshot of the mutable execution state of one run, persisted alongside
/// the workflow document so a restarted driver resumes with the same worker
/// assignments, conversation histories, branch names and retry counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub run_id: String,
    /// subtask id -> worker id
    #[serde(default)]
    pub worker_assignments: HashMap<String, String>,
    /// agent id -> ordered conversation turns
    #[serde(default)]
    pub conversation_histories: HashMap<String, Vec<String>>,
    /// subtask id -> git branch
    #[serde(default)]
    pub git_branches: HashMap<String, String>,
    /// subtask id -> failures so far
    #[serde(default)]
    pub retry_counts: HashMap<String, u32>,
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }
}

/// State Manager - save/load of execution-state snapshots for resume.
#[derive(Debug, Clone)]
pub struct StateManager {
    store: Arc<RunStore>,
}

impl StateManager {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn save_state(&self, state: &ExecutionState) -> StoreResult<()> {
        let mut stamped = state.clone();
        stamped.saved_at = Some(Utc::now());
        self.store
            .save_document(&state.run_id, STATE_DOCUMENT, &stamped)
    }

    pub fn load_state(&self, run_id: &str) -> StoreResult<Option<ExecutionState>> {
        self.store.load_document(run_id, STATE_DOCUMENT)
    }
}
