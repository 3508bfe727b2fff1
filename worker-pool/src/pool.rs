use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use worker_runtime::{ContainerRuntime, IsolationConfig, WorkerContainer};

use crate::{PoolError, PoolResult, WorkerType};

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Worker Pool - bounded set of long-lived worker slots.
///
/// Capacity is `max_workers`; acquisition is by worker type, preferring the
/// longest-idle candidate, spawning a fresh worker while under capacity and
/// reporting exhaustion as `None`. Released workers lose their container and
/// return to idle; a new container is created on the next acquisition so no
/// state leaks between assignments. Internals sit behind a single lock.
#[derive(Debug)]
pub struct WorkerPool {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub container_prefix: String,
    pub worker_image: String,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub workspace_base: PathBuf,
    /// Run directory mounted read-only at /results in every worker.
    pub results_dir: Option<PathBuf>,
    pub stall_timeout: Duration,
}

impl PoolConfig {
    pub fn new(max_workers: usize, workspace_base: impl Into<PathBuf>) -> Self {
        Self {
            max_workers,
            container_prefix: "acw".to_string(),
            worker_image: "agent-company/worker:latest".to_string(),
            memory_limit: "4g".to_string(),
            cpu_limit: "2".to_string(),
            workspace_base: workspace_base.into(),
            results_dir: None,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    workers: HashMap<String, PoolWorker>,
}

#[derive(Debug)]
struct PoolWorker {
    id: String,
    worker_type: WorkerType,
    status: WorkerStatus,
    container: Option<WorkerContainer>,
    idle_since: DateTime<Utc>,
    busy_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Paused,
    Error,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub idle_since: DateTime<Utc>,
    pub busy_since: Option<DateTime<Utc>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Acquires an idle worker of the requested type, spawning one while
    /// under capacity. Returns `None` when the pool is exhausted; the
    /// dispatcher re-queues and retries.
    pub async fn acquire_by_type(&self, worker_type: WorkerType) -> PoolResult<Option<String>> {
        let mut inner = self.inner.lock().await;

        let candidate = inner
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle && w.worker_type == worker_type)
            .min_by_key(|w| w.idle_since)
            .map(|w| w.id.clone());

        if let Some(worker_id) = candidate {
            let container = self.fresh_container(&worker_id).await?;
            let worker = inner
                .workers
                .get_mut(&worker_id)
                .ok_or_else(|| PoolError::UnknownWorker(worker_id.clone()))?;
            worker.container = Some(container);
            worker.status = WorkerStatus::Working;
            worker.busy_since = Some(Utc::now());
            info!(worker = %worker_id, r#type = %worker_type, "acquired idle worker");
            return Ok(Some(worker_id));
        }

        let live = inner
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Terminated)
            .count();
        if live >= self.config.max_workers {
            return Ok(None);
        }

        let worker_id = format!("{}-{}", worker_type, uuid::Uuid::new_v4().simple());
        let container = self.fresh_container(&worker_id).await?;
        inner.workers.insert(
            worker_id.clone(),
            PoolWorker {
                id: worker_id.clone(),
                worker_type,
                status: WorkerStatus::Working,
                container: Some(container),
                idle_since: Utc::now(),
                busy_since: Some(Utc::now()),
            },
        );
        info!(worker = %worker_id, r#type = %worker_type, "spawned worker");
        Ok(Some(worker_id))
    }

    /// Destroys the worker's container and returns the slot to idle.
    pub async fn release(&self, worker_id: &str) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;

        if worker.status == WorkerStatus::Terminated {
            return Err(PoolError::InvalidState {
                worker_id: worker_id.to_string(),
                status: "terminated".to_string(),
                operation: "release".to_string(),
            });
        }

        if let Some(mut container) = worker.container.take() {
            container.destroy().await?;
        }
        worker.status = WorkerStatus::Idle;
        worker.busy_since = None;
        worker.idle_since = Utc::now();
        info!(worker = %worker_id, "released worker");
        Ok(())
    }

    pub async fn pause(&self, worker_id: &str) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        match worker.status {
            WorkerStatus::Idle | WorkerStatus::Working => {
                worker.status = WorkerStatus::Paused;
                Ok(())
            }
            other => Err(PoolError::InvalidState {
                worker_id: worker_id.to_string(),
                status: format!("{other:?}").to_lowercase(),
                operation: "pause".to_string(),
            }),
        }
    }

    pub async fn resume(&self, worker_id: &str) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        if worker.status != WorkerStatus::Paused {
            return Err(PoolError::InvalidState {
                worker_id: worker_id.to_string(),
                status: format!("{:?}", worker.status).to_lowercase(),
                operation: "resume".to_string(),
            });
        }
        worker.status = WorkerStatus::Idle;
        worker.idle_since = Utc::now();
        Ok(())
    }

    /// Absorbing: a terminated worker never serves again.
    pub async fn terminate(&self, worker_id: &str) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        if let Some(mut container) = worker.container.take() {
            container.destroy().await?;
        }
        worker.status = WorkerStatus::Terminated;
        worker.busy_since = None;
        Ok(())
    }

    /// Health check for workers busy past the stall timeout. Unresponsive
    /// workers are marked error, torn down and removed; their ids are
    /// returned so the dispatcher can reassign the affected subtasks.
    pub async fn check_stalled(&self) -> PoolResult<Vec<String>> {
        let now = Utc::now();
        let stall = chrono::Duration::from_std(self.config.stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let mut inner = self.inner.lock().await;
        let suspect_ids: Vec<String> = inner
            .workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Working
                    && w.busy_since.is_some_and(|since| now - since > stall)
            })
            .map(|w| w.id.clone())
            .collect();

        let mut removed = Vec::new();
        for worker_id in suspect_ids {
            let healthy = match inner
                .workers
                .get(&worker_id)
                .and_then(|w| w.container.as_ref())
                .and_then(|c| c.container_id().map(str::to_string))
            {
                Some(container_id) => self
                    .runtime
                    .inspect(&container_id)
                    .await
                    .map(|i| i.healthy)
                    .unwrap_or(false),
                None => false,
            };

            if healthy {
                continue;
            }

            warn!(worker = %worker_id, "stalled worker failed health check, removing");
            if let Some(mut worker) = inner.workers.remove(&worker_id) {
                worker.status = WorkerStatus::Error;
                if let Some(mut container) = worker.container.take() {
                    let _ = container.destroy().await;
                }
                removed.push(worker_id);
            }
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> Vec<WorkerInfo> {
        let inner = self.inner.lock().await;
        let mut infos: Vec<WorkerInfo> = inner
            .workers
            .values()
            .map(|w| WorkerInfo {
                id: w.id.clone(),
                worker_type: w.worker_type,
                status: w.status,
                idle_since: w.idle_since,
                busy_since: w.busy_since,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn shutdown(&self) -> PoolResult<()> {
        let mut inner = self.inner.lock().await;
        for worker in inner.workers.values_mut() {
            if let Some(mut container) = worker.container.take() {
                let _ = container.destroy().await;
            }
            worker.status = WorkerStatus::Terminated;
        }
        Ok(())
    }

    async fn fresh_container(&self, worker_id: &str) -> PoolResult<WorkerContainer> {
        let isolation = IsolationConfig::for_worker(
            &self.config.workspace_base,
            worker_id,
            self.config.results_dir.as_deref(),
        );
        let mut container = WorkerContainer::new(
            self.runtime.clone(),
            &self.config.container_prefix,
            worker_id,
            self.config.worker_image.clone(),
            isolation,
            self.config.memory_limit.clone(),
            self.config.cpu_limit.clone(),
        );
        container.create().await?;
        container.start().await?;
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_runtime::InMemoryRuntime;

    fn pool_with(max: usize) -> (Arc<InMemoryRuntime>, WorkerPool) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut config = PoolConfig::new(max, "/tmp/ws");
        config.stall_timeout = Duration::from_secs(0);
        (runtime.clone(), WorkerPool::new(config, runtime))
    }

    #[tokio::test]
    async fn acquire_spawns_until_capacity_then_none() {
        let (_runtime, pool) = pool_with(2);

        let a = pool.acquire_by_type(WorkerType::Developer).await.unwrap();
        let b = pool.acquire_by_type(WorkerType::Developer).await.unwrap();
        let c = pool.acquire_by_type(WorkerType::Developer).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn release_destroys_container_and_allows_reacquire() {
        let (runtime, pool) = pool_with(1);

        let worker_id = pool
            .acquire_by_type(WorkerType::Test)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runtime.live_count(), 1);

        pool.release(&worker_id).await.unwrap();
        assert_eq!(runtime.live_count(), 0);

        let again = pool.acquire_by_type(WorkerType::Test).await.unwrap().unwrap();
        assert_eq!(again, worker_id);
        assert_eq!(runtime.live_count(), 1);
    }

    #[tokio::test]
    async fn idle_candidates_prefer_longest_idle() {
        let (_runtime, pool) = pool_with(2);

        let first = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();

        // Release in reverse order so `first` has the older idle stamp.
        pool.release(&second).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(&first).await.unwrap();

        let picked = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked, second);
    }

    #[tokio::test]
    async fn type_mismatch_spawns_separate_worker() {
        let (_runtime, pool) = pool_with(2);
        let dev = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        pool.release(&dev).await.unwrap();

        let test_worker = pool.acquire_by_type(WorkerType::Test).await.unwrap().unwrap();
        assert_ne!(dev, test_worker);
    }

    #[tokio::test]
    async fn terminated_worker_is_absorbing() {
        let (_runtime, pool) = pool_with(1);
        let worker_id = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();

        pool.terminate(&worker_id).await.unwrap();
        assert!(pool.release(&worker_id).await.is_err());

        // Terminated slots do not count toward capacity.
        let fresh = pool.acquire_by_type(WorkerType::Developer).await.unwrap();
        assert!(fresh.is_some());
    }

    #[tokio::test]
    async fn stalled_unresponsive_worker_is_removed() {
        let (runtime, pool) = pool_with(1);
        let worker_id = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();

        // Kill the container behind the pool's back so the health check
        // fails to inspect it.
        runtime.kill_all();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let removed = pool.check_stalled().await.unwrap();
        assert_eq!(removed, vec![worker_id]);
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn paused_worker_is_skipped_until_resumed() {
        let (_runtime, pool) = pool_with(2);
        let worker_id = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        pool.release(&worker_id).await.unwrap();
        pool.pause(&worker_id).await.unwrap();

        // The paused slot is not a candidate; a second slot spawns instead.
        let other = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(other, worker_id);

        pool.resume(&worker_id).await.unwrap();
        pool.release(&other).await.unwrap();
        let snapshot = pool.snapshot().await;
        assert!(snapshot.iter().all(|w| w.status == WorkerStatus::Idle));
    }

    #[tokio::test]
    async fn stalled_but_healthy_worker_survives_check() {
        let (_runtime, pool) = pool_with(1);
        let worker_id = pool
            .acquire_by_type(WorkerType::Developer)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let removed = pool.check_stalled().await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(pool.snapshot().await[0].id, worker_id);
    }
}
