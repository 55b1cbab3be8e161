//! Error types for agentmesh.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing collaborator credentials or a failed dependency-layer step.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// The worker's classification call returned unusable output.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A registered handler failed during dispatch.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A worker failed to process a message on the immediate path.
    #[error("Processing error: {0}")]
    Processing(String),

    /// Writing to the storage collaborator failed.
    #[error("Persist error: {0}")]
    Persist(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::providers::ProviderError),

    #[error("Agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
