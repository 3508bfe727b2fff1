use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error taxonomy. Everything below `Internal` is caught and handled
/// by the workflow driver; anything that would otherwise propagate out of a
/// driver is reclassified as `Internal` and forces the workflow into
/// `failed`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no pending approval for workflow {0}")]
    NoPendingApproval(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<run_store::StoreError> for EngineError {
    fn from(e: run_store::StoreError) -> Self {
        EngineError::Internal(format!("store: {e}"))
    }
}

impl From<agent_bus::BusError> for EngineError {
    fn from(e: agent_bus::BusError) -> Self {
        match e {
            agent_bus::BusError::InvalidMessage(m) => EngineError::InvalidArgument(m),
            other => EngineError::Internal(format!("bus: {other}")),
        }
    }
}

impl From<worker_pool::PoolError> for EngineError {
    fn from(e: worker_pool::PoolError) -> Self {
        EngineError::Internal(format!("pool: {e}"))
    }
}

impl From<worker_runtime::ContainerError> for EngineError {
    fn from(e: worker_runtime::ContainerError) -> Self {
        EngineError::Internal(format!("container: {e}"))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

/// Resolution of an approval future that was cancelled instead of decided.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("approval cancelled: {reason}")]
pub struct ApprovalCancelled {
    pub reason: String,
}
