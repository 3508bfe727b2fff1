use thiserror::Error;

pub mod ids;
pub mod reporter;
pub mod state;
pub mod store;
pub mod trackers;

pub use ids::*;
pub use reporter::*;
pub use state::*;
pub use store::*;
pub use trackers::*;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("document {name} missing for run {run_id}")]
    DocumentMissing { run_id: String, name: String },

    #[error("artifact source {0} does not exist")]
    ArtifactMissing(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error for {name}: {source}")]
    Serde {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
