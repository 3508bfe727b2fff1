use thiserror::Error;

pub mod pool;
pub mod registry;

pub use pool::*;
pub use registry::*;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker {0} not found")]
    UnknownWorker(String),

    #[error("worker {worker_id} cannot {operation} while {status}")]
    InvalidState {
        worker_id: String,
        status: String,
        operation: String,
    },

    #[error(transparent)]
    Container(#[from] worker_runtime::ContainerError),
}
