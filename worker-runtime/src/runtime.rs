use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ContainerResult;

/// Container Runtime - capability interface over the concrete back-end
/// (docker-on-docker, rootless, nested). The engine never talks to a
/// container daemon directly; everything goes through this trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String>;
    async fn start(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop(&self, container_id: &str) -> ContainerResult<()>;
    async fn remove(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn inspect(&self, container_id: &str) -> ContainerResult<ContainerInspection>;
    async fn logs(&self, container_id: &str) -> ContainerResult<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub isolation: IsolationConfig,
    pub memory_limit: String,
    pub cpu_limit: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Isolation settings every worker container runs under. The results mount
/// is read-only by construction; there is no way to express a shared
/// read-write bind here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationConfig {
    pub network_mode: String,
    /// Host directory backing the container's private `/workspace`.
    pub workspace_dir: PathBuf,
    /// Host run directory mounted read-only at `/results`, if any.
    pub results_mount_ro: Option<PathBuf>,
    pub no_new_privileges: bool,
    pub drop_all_capabilities: bool,
    pub pids_limit: u32,
}

impl IsolationConfig {
    /// Standard isolation for one worker: network disabled, private
    /// workspace keyed by worker id, run directory visible read-only.
    pub fn for_worker(
        workspace_base: &Path,
        worker_id: &str,
        results_dir: Option<&Path>,
    ) -> Self {
        Self {
            network_mode: "none".to_string(),
            workspace_dir: workspace_base.join(worker_id),
            results_mount_ro: results_dir.map(Path::to_path_buf),
            no_new_privileges: true,
            drop_all_capabilities: true,
            pids_limit: 256,
        }
    }

    pub fn is_network_isolated(&self) -> bool {
        self.network_mode == "none"
    }

    /// True when the two configs could write to a common path.
    pub fn shares_writable_path_with(&self, other: &IsolationConfig) -> bool {
        self.workspace_dir == other.workspace_dir
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[serde(rename = "null")]
    None,
    Created,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::None => "null",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInspection {
    pub container_id: String,
    pub name: String,
    pub state: ContainerState,
    pub healthy: bool,
    pub isolation: IsolationConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_isolation_defaults_are_locked_down() {
        let iso = IsolationConfig::for_worker(Path::new("/tmp/ws"), "developer-1", None);
        assert!(iso.is_network_isolated());
        assert!(iso.no_new_privileges);
        assert!(iso.drop_all_capabilities);
        assert!(iso.pids_limit > 0);
        assert_eq!(iso.workspace_dir, PathBuf::from("/tmp/ws/developer-1"));
    }

    #[test]
    fn distinct_workers_share_no_writable_path() {
        let base = Path::new("/tmp/ws");
        let results = Path::new("/tmp/runtime/runs/run-1");
        let a = IsolationConfig::for_worker(base, "developer-1", Some(results));
        let b = IsolationConfig::for_worker(base, "test-1", Some(results));
        // The run directory is shared but read-only; workspaces are private.
        assert!(!a.shares_writable_path_with(&b));
    }
}
