use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    ContainerError, ContainerResult, ContainerRuntime, ContainerSpec, ContainerState,
    IsolationConfig,
};

pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Container name for a worker: `<prefix>-<workerId>`, reversible via
/// [`worker_id_from_name`].
pub fn container_name(prefix: &str, worker_id: &str) -> String {
    format!("{prefix}-{worker_id}")
}

pub fn worker_id_from_name<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_prefix('-')
}

/// Worker Container - lifecycle wrapper around one runtime container.
///
/// States move `null -> created -> running -> stopped -> destroyed`;
/// `destroy` is idempotent and bounded by the cleanup timeout, after which
/// the force path tears the container down even if `stop` fails. After a
/// destroy the same worker id can be given a fresh container with no state
/// carried over.
#[derive(Debug)]
pub struct WorkerContainer {
    worker_id: String,
    name: String,
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    container_id: Option<String>,
    state: ContainerState,
    cleanup_timeout: Duration,
}

impl WorkerContainer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        prefix: &str,
        worker_id: impl Into<String>,
        image: impl Into<String>,
        isolation: IsolationConfig,
        memory_limit: impl Into<String>,
        cpu_limit: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        let name = container_name(prefix, &worker_id);
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.into(),
            isolation,
            memory_limit: memory_limit.into(),
            cpu_limit: cpu_limit.into(),
            env: HashMap::new(),
        };
        Self {
            worker_id,
            name,
            runtime,
            spec,
            container_id: None,
            state: ContainerState::None,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn isolation(&self) -> &IsolationConfig {
        &self.spec.isolation
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub async fn create(&mut self) -> ContainerResult<()> {
        match self.state {
            ContainerState::None | ContainerState::Destroyed => {}
            other => {
                return Err(ContainerError::InvalidTransition {
                    from: other.to_string(),
                    operation: "create".to_string(),
                })
            }
        }
        let container_id = self.runtime.create(&self.spec).await?;
        debug!(worker = %self.worker_id, container = %container_id, "created worker container");
        self.container_id = Some(container_id);
        self.state = ContainerState::Created;
        Ok(())
    }

    pub async fn start(&mut self) -> ContainerResult<()> {
        if self.state != ContainerState::Created {
            return Err(ContainerError::InvalidTransition {
                from: self.state.to_string(),
                operation: "start".to_string(),
            });
        }
        let id = self.require_id()?;
        self.runtime.start(&id).await?;
        self.state = ContainerState::Running;
        Ok(())
    }

    pub async fn stop(&mut self) -> ContainerResult<()> {
        if self.state != ContainerState::Running {
            return Err(ContainerError::InvalidTransition {
                from: self.state.to_string(),
                operation: "stop".to_string(),
            });
        }
        let id = self.require_id()?;
        self.runtime.stop(&id).await?;
        self.state = ContainerState::Stopped;
        Ok(())
    }

    /// Idempotent teardown. Graceful stop+remove first; if that errors or
    /// outlives the cleanup timeout, the force path removes the container
    /// regardless of stop failures.
    pub async fn destroy(&mut self) -> ContainerResult<()> {
        let Some(id) = self.container_id.clone() else {
            self.state = ContainerState::Destroyed;
            return Ok(());
        };
        if self.state == ContainerState::Destroyed {
            return Ok(());
        }

        let graceful = tokio::time::timeout(self.cleanup_timeout, async {
            if self.state == ContainerState::Running {
                self.runtime.stop(&id).await?;
            }
            self.runtime.remove(&id, false).await
        })
        .await;

        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(worker = %self.worker_id, error = %e, "graceful destroy failed, forcing");
                self.force_remove(&id).await?;
            }
            Err(_) => {
                warn!(
                    worker = %self.worker_id,
                    timeout_secs = self.cleanup_timeout.as_secs(),
                    "cleanup timeout exceeded, forcing"
                );
                self.force_remove(&id).await?;
            }
        }

        self.container_id = None;
        self.state = ContainerState::Destroyed;
        Ok(())
    }

    async fn force_remove(&self, container_id: &str) -> ContainerResult<()> {
        match self.runtime.remove(container_id, true).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn require_id(&self) -> ContainerResult<String> {
        self.container_id
            .clone()
            .ok_or_else(|| ContainerError::NotFound(self.name.clone()))
    }
}
