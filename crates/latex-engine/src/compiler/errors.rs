//! Error types for unexpected orchestration failures
//!
//! Expected failures (bad input, rejected documents, timeouts, a missing
//! engine) are [`CompilationOutcome`](super::CompilationOutcome) variants.
//! `EngineError` is reserved for the rest.

use thiserror::Error;

/// Unexpected failures while orchestrating a compilation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Compilation queue closed")]
    QueueClosed,
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::TaskFailed(err.to_string())
    }
}
