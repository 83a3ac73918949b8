//! Classified compilation results

use serde::{Deserialize, Serialize};

/// Result of a compilation request
///
/// Each variant is a distinct failure mode a caller can inspect; the
/// transport layer maps them onto responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationOutcome {
    /// The engine produced a PDF
    Success {
        artifact: Vec<u8>,
        artifact_name: String,
    },
    /// The first pass exited non-zero
    CompilationFailed {
        stdout_excerpt: String,
        stderr_excerpt: String,
    },
    /// Both passes ran but no PDF was written
    ArtifactMissing {
        stdout_excerpt: String,
        stderr_excerpt: String,
    },
    /// A pass exceeded its wall-clock budget and was killed
    Timeout,
    /// The engine binary could not be run
    EngineUnavailable,
    /// The request was rejected before the engine ran
    InvalidInput { reason: String },
    /// Too little free space on the workspace filesystem to accept an upload
    InsufficientStorage,
}

impl CompilationOutcome {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        CompilationOutcome::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompilationOutcome::Success { .. })
    }

    /// Short machine-readable label, used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            CompilationOutcome::Success { .. } => "success",
            CompilationOutcome::CompilationFailed { .. } => "compilation_failed",
            CompilationOutcome::ArtifactMissing { .. } => "artifact_missing",
            CompilationOutcome::Timeout => "timeout",
            CompilationOutcome::EngineUnavailable => "engine_unavailable",
            CompilationOutcome::InvalidInput { .. } => "invalid_input",
            CompilationOutcome::InsufficientStorage => "insufficient_storage",
        }
    }
}

/// Status report returned by the diagnostics path instead of a PDF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationReport {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub log: String,
}

impl CompilationReport {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            log: String::new(),
        }
    }
}

/// First `max_chars` characters of `text`
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
