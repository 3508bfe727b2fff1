use thiserror::Error;

pub mod container;
pub mod memory;
pub mod runtime;

pub use container::*;
pub use memory::*;
pub use runtime::*;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("container name {0} already in use")]
    NameInUse(String),

    #[error("invalid lifecycle transition from {from} via {operation}")]
    InvalidTransition { from: String, operation: String },

    #[error("cleanup of container {name} exceeded {timeout_secs}s")]
    CleanupTimeout { name: String, timeout_secs: u64 },

    #[error("runtime backend error: {0}")]
    Backend(String),
}
