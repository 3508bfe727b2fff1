use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{StoreError, StoreResult};

/// Run Store - Owns the on-disk layout of everything about one execution.
///
/// Layout under the runtime root:
/// - `state/` - config, performance and tech-debt time-series
/// - `runs/<run-id>/` - task.json, workflow.json, proposal.json, artifacts/,
///   reviews.log, agent.log, report.md
/// - `workspaces/<project-id>/` - per-project repository checkouts
///
/// Every document save goes through `<file>.tmp` + fsync + rename, so a
/// crash mid-write leaves the previous committed version intact. Writers
/// serialize per file through a lock map.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskMetadata {
    pub run_id: String,
    pub workflow_id: String,
    pub project_id: String,
    pub instruction: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactAction {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub source_path: String,
    /// Basename inside `artifacts/`; `None` for deleted artifacts, which are
    /// recorded but never copied.
    pub stored_name: Option<String>,
    pub action: ArtifactAction,
    pub collected_at: DateTime<Utc>,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let store = Self {
            root,
            file_locks: DashMap::new(),
        };
        for dir in [store.runs_dir(), store.state_dir(), store.workspaces_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn workspace_dir(&self, project_id: &str) -> PathBuf {
        self.workspaces_dir().join(project_id)
    }

    pub fn create_run_dir(&self, run_id: &str) -> StoreResult<PathBuf> {
        let dir = self.run_dir(run_id);
        for sub in ["artifacts", "reports"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        debug!(run_id, "created run directory");
        Ok(dir)
    }

    pub fn save_task_metadata(&self, run_id: &str, meta: &RunTaskMetadata) -> StoreResult<()> {
        self.save_document(run_id, "task.json", meta)
    }

    pub fn load_task_metadata(&self, run_id: &str) -> StoreResult<Option<RunTaskMetadata>> {
        self.load_document(run_id, "task.json")
    }

    /// Atomic save of a JSON document into the run directory.
    pub fn save_document<T: Serialize>(
        &self,
        run_id: &str,
        name: &str,
        value: &T,
    ) -> StoreResult<()> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        let path = dir.join(name);
        let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serde {
            name: name.to_string(),
            source: e,
        })?;
        self.write_atomic(&path, &json)
    }

    pub fn load_document<T: DeserializeOwned>(
        &self,
        run_id: &str,
        name: &str,
    ) -> StoreResult<Option<T>> {
        let path = self.run_dir(run_id).join(name);
        let _guard = self.lock_for(&path);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Serde {
            name: name.to_string(),
            source: e,
        })?;
        Ok(Some(value))
    }

    /// Appends one line to an append-only log (`reviews.log`, `agent.log`).
    /// Lines are prefixed with an RFC 3339 UTC timestamp; the caller supplies
    /// the tag and body.
    pub fn append_log(&self, run_id: &str, name: &str, line: &str) -> StoreResult<()> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        let path = dir.join(name);
        let _guard = self.lock_for(&path);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    pub fn read_log(&self, run_id: &str, name: &str) -> StoreResult<Vec<String>> {
        let path = self.run_dir(run_id).join(name);
        let _guard = self.lock_for(&path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        Ok(content.lines().map(str::to_string).collect())
    }

    /// Copies an artifact into `runs/<runId>/artifacts/`. Deleted artifacts
    /// keep their record but no copy is made. Basename collisions are
    /// disambiguated with a numeric suffix before the extension.
    pub fn collect_artifact(
        &self,
        run_id: &str,
        src: &Path,
        action: ArtifactAction,
    ) -> StoreResult<ArtifactRecord> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }

        let record_base = ArtifactRecord {
            source_path: src.display().to_string(),
            stored_name: None,
            action,
            collected_at: Utc::now(),
        };

        if action == ArtifactAction::Deleted {
            return Ok(record_base);
        }

        if !src.exists() {
            return Err(StoreError::ArtifactMissing(src.display().to_string()));
        }

        let artifacts = dir.join("artifacts");
        fs::create_dir_all(&artifacts).map_err(|e| StoreError::io(&artifacts, e))?;

        let basename = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let stored_name = Self::disambiguate(&artifacts, &basename);
        let dest = artifacts.join(&stored_name);
        fs::copy(src, &dest).map_err(|e| StoreError::io(&dest, e))?;

        debug!(run_id, artifact = %stored_name, "collected artifact");
        Ok(ArtifactRecord {
            stored_name: Some(stored_name),
            ..record_base
        })
    }

    pub fn list_runs(&self) -> StoreResult<Vec<String>> {
        let dir = self.runs_dir();
        let mut runs = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if entry.path().is_dir() {
                runs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Removes run directories older than the retention window. Age comes
    /// from the timestamp embedded in the run id, falling back to directory
    /// mtime for foreign names.
    pub fn prune_runs(&self, retention_days: u32) -> StoreResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut removed = 0;
        for run_id in self.list_runs()? {
            let created = Self::run_created_at(&run_id)
                .or_else(|| self.dir_mtime(&self.run_dir(&run_id)));
            let Some(created) = created else { continue };
            if created < cutoff {
                let dir = self.run_dir(&run_id);
                match fs::remove_dir_all(&dir) {
                    Ok(()) => {
                        removed += 1;
                        info!(run_id, "pruned expired run directory");
                    }
                    Err(e) => warn!(run_id, error = %e, "failed to prune run directory"),
                }
            }
        }
        Ok(removed)
    }

    fn run_created_at(run_id: &str) -> Option<DateTime<Utc>> {
        let millis: i64 = run_id.strip_prefix("run-")?.split('-').next()?.parse().ok()?;
        DateTime::from_timestamp_millis(millis)
    }

    fn dir_mtime(&self, dir: &Path) -> Option<DateTime<Utc>> {
        let modified = fs::metadata(dir).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    fn disambiguate(dir: &Path, basename: &str) -> String {
        if !dir.join(basename).exists() {
            return basename.to_string();
        }
        let (stem, ext) = match basename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (basename.to_string(), None),
        };
        for n in 1.. {
            let candidate = match &ext {
                Some(ext) => format!("{}-{}.{}", stem, n, ext),
                None => format!("{}-{}", stem, n),
            };
            if !dir.join(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!("suffix search is unbounded")
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let lock = self.lock_for(path);
        let _guard = lock.lock();

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runtime")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_and_load_round_trips_task_metadata() {
        let (_tmp, store) = store();
        store.create_run_dir("run-1-a").unwrap();

        let meta = RunTaskMetadata {
            run_id: "run-1-a".to_string(),
            workflow_id: "wf-0000abcd".to_string(),
            project_id: "proj-001".to_string(),
            instruction: "Implement login endpoint".to_string(),
            created_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        store.save_task_metadata("run-1-a", &meta).unwrap();

        let loaded = store.load_task_metadata("run-1-a").unwrap().unwrap();
        assert_eq!(loaded.workflow_id, meta.workflow_id);
        assert_eq!(loaded.instruction, meta.instruction);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let (_tmp, store) = store();
        store.create_run_dir("run-2-b").unwrap();

        let doc = json!({
            "runId": "run-2-b",
            "workflowId": "wf-00000001",
            "projectId": "p",
            "instruction": "x",
            "createdAt": Utc::now().to_rfc3339(),
            "futureField": {"nested": true},
        });
        store.save_document("run-2-b", "task.json", &doc).unwrap();

        let typed = store.load_task_metadata("run-2-b").unwrap().unwrap();
        store.save_task_metadata("run-2-b", &typed).unwrap();

        let raw: serde_json::Value = store.load_document("run-2-b", "task.json").unwrap().unwrap();
        assert_eq!(raw["futureField"]["nested"], json!(true));
    }

    #[test]
    fn save_never_leaves_tmp_behind() {
        let (_tmp, store) = store();
        store.create_run_dir("run-3-c").unwrap();
        store
            .save_document("run-3-c", "workflow.json", &json!({"ok": true}))
            .unwrap();
        assert!(store.run_dir("run-3-c").join("workflow.json").exists());
        assert!(!store.run_dir("run-3-c").join("workflow.tmp").exists());
    }

    #[test]
    fn artifact_collision_gets_suffix() {
        let (tmp, store) = store();
        store.create_run_dir("run-4-d").unwrap();

        let src = tmp.path().join("main.rs");
        std::fs::write(&src, "fn main() {}").unwrap();

        let first = store
            .collect_artifact("run-4-d", &src, ArtifactAction::Created)
            .unwrap();
        let second = store
            .collect_artifact("run-4-d", &src, ArtifactAction::Modified)
            .unwrap();

        assert_eq!(first.stored_name.as_deref(), Some("main.rs"));
        assert_eq!(second.stored_name.as_deref(), Some("main-1.rs"));
    }

    #[test]
    fn deleted_artifact_keeps_record_without_copy() {
        let (_tmp, store) = store();
        store.create_run_dir("run-5-e").unwrap();

        let record = store
            .collect_artifact(
                "run-5-e",
                Path::new("/nowhere/gone.rs"),
                ArtifactAction::Deleted,
            )
            .unwrap();
        assert_eq!(record.action, ArtifactAction::Deleted);
        assert!(record.stored_name.is_none());
    }

    #[test]
    fn log_lines_carry_rfc3339_prefix() {
        let (_tmp, store) = store();
        store.create_run_dir("run-6-f").unwrap();
        store
            .append_log("run-6-f", "reviews.log", "[REQUEST] ticket=t-1 worker=w-1")
            .unwrap();

        let lines = store.read_log("run-6-f", "reviews.log").unwrap();
        assert_eq!(lines.len(), 1);
        let (ts, rest) = lines[0].split_once(' ').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(rest.starts_with("[REQUEST]"));
    }

    #[test]
    fn prune_removes_only_expired_runs() {
        let (_tmp, store) = store();
        let old_ts = (Utc::now() - chrono::Duration::days(30)).timestamp_millis();
        let old_run = format!("run-{}-old123", old_ts);
        store.create_run_dir(&old_run).unwrap();
        let fresh = new_fresh_run();
        store.create_run_dir(&fresh).unwrap();

        let removed = store.prune_runs(7).unwrap();
        assert_eq!(removed, 1);
        let remaining = store.list_runs().unwrap();
        assert_eq!(remaining, vec![fresh]);
    }

    fn new_fresh_run() -> String {
        format!("run-{}-fresh1", Utc::now().timestamp_millis())
    }
}
