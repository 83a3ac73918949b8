//! Error types for the LaTeX server

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use latex_engine::{CompilationOutcome, EngineError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    CompileError(String),

    #[error("PDF file was not created")]
    ArtifactMissing,

    #[error("LaTeX compilation timeout")]
    Timeout,

    #[error("{0} not available")]
    EngineUnavailable(String),

    #[error("Insufficient disk space on server")]
    InsufficientStorage,

    #[error("Compilation error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: String,
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) | ServerError::CompileError(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ServerError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            ServerError::ArtifactMissing
            | ServerError::EngineUnavailable(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "INVALID_REQUEST",
            ServerError::CompileError(_) => "COMPILE_ERROR",
            ServerError::ArtifactMissing => "ARTIFACT_MISSING",
            ServerError::Timeout => "TIMEOUT",
            ServerError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            ServerError::InsufficientStorage => "INSUFFICIENT_STORAGE",
            ServerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ServerError {
    fn from(err: EngineError) -> Self {
        error!("Compilation error: {}", err);
        ServerError::Internal(err.to_string())
    }
}

/// Characters left bare in an RFC 5987 `filename*` value
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// `Content-Disposition` value for a downloaded PDF
///
/// Plain names are sent as `filename=<name>`. Anything with spaces,
/// separators, quotes or non-ASCII characters gets a quoted ASCII fallback
/// and the exact name in `filename*`.
pub fn attachment_disposition(file_name: &str) -> String {
    let is_token = !file_name.is_empty()
        && file_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b));
    if is_token {
        return format!("attachment; filename={}", file_name);
    }

    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(file_name, ATTR_CHAR)
    )
}

/// Map a compilation outcome to its HTTP response
///
/// `engine` names the engine in the unavailable message.
pub fn outcome_response(outcome: CompilationOutcome, engine: &str) -> Response {
    match outcome {
        CompilationOutcome::Success {
            artifact,
            artifact_name,
        } => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    attachment_disposition(&artifact_name),
                ),
            ],
            artifact,
        )
            .into_response(),
        CompilationOutcome::CompilationFailed {
            stdout_excerpt,
            stderr_excerpt,
        } => ServerError::CompileError(format!(
            "LaTeX compilation failed: {} \n {}",
            stdout_excerpt, stderr_excerpt
        ))
        .into_response(),
        CompilationOutcome::ArtifactMissing {
            stdout_excerpt,
            stderr_excerpt,
        } => {
            warn!(
                "No PDF produced; stdout: {} stderr: {}",
                stdout_excerpt, stderr_excerpt
            );
            ServerError::ArtifactMissing.into_response()
        }
        CompilationOutcome::Timeout => ServerError::Timeout.into_response(),
        CompilationOutcome::EngineUnavailable => {
            ServerError::EngineUnavailable(engine.to_string()).into_response()
        }
        CompilationOutcome::InvalidInput { reason } => {
            ServerError::InvalidRequest(reason).into_response()
        }
        CompilationOutcome::InsufficientStorage => ServerError::InsufficientStorage.into_response(),
    }
}
