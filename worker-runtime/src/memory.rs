use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    ContainerError, ContainerInspection, ContainerResult, ContainerRuntime, ContainerSpec,
    ContainerState,
};

/// In-process runtime used by the test suites and as a stand-in wiring when
/// no container daemon is available. Honors the full lifecycle contract of
/// [`ContainerRuntime`] without creating real containers.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    containers: DashMap<String, StoredContainer>,
    fail_stops: bool,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    spec: ContainerSpec,
    state: ContainerState,
    log: String,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `stop` fails; exercises the force-destroy path.
    pub fn with_failing_stops() -> Self {
        Self {
            containers: DashMap::new(),
            fail_stops: true,
        }
    }

    pub fn live_count(&self) -> usize {
        self.containers.len()
    }

    /// Drops every container, as if the daemon died under the pool.
    pub fn kill_all(&self) {
        self.containers.clear();
    }

    fn get(&self, container_id: &str) -> ContainerResult<StoredContainer> {
        self.containers
            .get(container_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        let name_taken = self
            .containers
            .iter()
            .any(|entry| entry.spec.name == spec.name);
        if name_taken {
            return Err(ContainerError::NameInUse(spec.name.clone()));
        }

        let container_id = format!("ctr-{}", Uuid::new_v4().simple());
        self.containers.insert(
            container_id.clone(),
            StoredContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
                log: String::new(),
            },
        );
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> ContainerResult<()> {
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        match entry.state {
            ContainerState::Created | ContainerState::Stopped => {
                entry.state = ContainerState::Running;
                entry.log.push_str("started\n");
                Ok(())
            }
            other => Err(ContainerError::InvalidTransition {
                from: other.to_string(),
                operation: "start".to_string(),
            }),
        }
    }

    async fn stop(&self, container_id: &str) -> ContainerResult<()> {
        if self.fail_stops {
            return Err(ContainerError::Backend("stop refused".to_string()));
        }
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        match entry.state {
            ContainerState::Running => {
                entry.state = ContainerState::Stopped;
                entry.log.push_str("stopped\n");
                Ok(())
            }
            // Stopping a non-running container is a no-op, mirroring the
            // behavior of the real back-ends.
            ContainerState::Created | ContainerState::Stopped => Ok(()),
            other => Err(ContainerError::InvalidTransition {
                from: other.to_string(),
                operation: "stop".to_string(),
            }),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        let state = self.get(container_id)?.state;
        if state == ContainerState::Running && !force {
            return Err(ContainerError::InvalidTransition {
                from: state.to_string(),
                operation: "remove".to_string(),
            });
        }
        self.containers.remove(container_id);
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> ContainerResult<ContainerInspection> {
        let stored = self.get(container_id)?;
        Ok(ContainerInspection {
            container_id: container_id.to_string(),
            name: stored.spec.name.clone(),
            state: stored.state,
            healthy: stored.state == ContainerState::Running,
            isolation: stored.spec.isolation,
        })
    }

    async fn logs(&self, container_id: &str) -> ContainerResult<String> {
        Ok(self.get(container_id)?.log)
    }
}
