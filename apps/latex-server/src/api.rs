//! API handlers for the LaTeX server
//!
//! Provides REST endpoints for:
//! - Inline source compilation
//! - Zipped project compilation
//! - Loose file batch compilation
//! - Compilation status reports
//! - Stale workspace cleanup

use axum::{
    extract::{Multipart, State},
    response::Response,
    Json,
};
use latex_engine::{CompilationReport, ProjectFile, SweepStats};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{outcome_response, ServerError};
use crate::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub engine_available: bool,
}

/// Handler: GET /health
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "latex-server",
        version: env!("CARGO_PKG_VERSION"),
        engine_available: state.compiler.probe_engine_availability().await,
    })
}

/// Inline compilation request body
#[derive(Deserialize)]
pub struct CompileRequest {
    /// LaTeX source of the whole document
    pub content: String,

    /// File stem used for the `.tex` source and the `.pdf` artifact
    #[serde(default = "default_filename")]
    pub filename: String,
}

fn default_filename() -> String {
    "document".to_string()
}

/// Handler: POST /compile
pub async fn handle_compile(
    State(state): State<AppState>,
    Json(req): Json<CompileRequest>,
) -> Result<Response, ServerError> {
    info!(
        "Compile request: filename={}, {} bytes",
        req.filename,
        req.content.len()
    );

    let outcome = state
        .compiler
        .compile_inline(&req.content, &req.filename)
        .await?;

    Ok(outcome_response(outcome, &state.engine_name()))
}

/// Handler: POST /compile-zip
///
/// Multipart fields: `file` (the `.zip` upload) and optional `main_filename`.
pub async fn handle_compile_zip(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ServerError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut main_filename: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(invalid_multipart)?;
                upload = Some((file_name, bytes.to_vec()));
            }
            Some("main_filename") => {
                let text = field.text().await.map_err(invalid_multipart)?;
                if !text.trim().is_empty() {
                    main_filename = Some(text);
                }
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let (file_name, bytes) = upload
        .ok_or_else(|| ServerError::InvalidRequest("Missing 'file' field".to_string()))?;
    if !file_name.ends_with(".zip") {
        return Err(ServerError::InvalidRequest(
            "File must be a ZIP archive".to_string(),
        ));
    }

    info!(
        "Compile zip request: file={}, {} bytes, main_filename={:?}",
        file_name,
        bytes.len(),
        main_filename
    );

    let outcome = state
        .compiler
        .compile_archive(bytes, main_filename)
        .await?;

    Ok(outcome_response(outcome, &state.engine_name()))
}

/// Handler: POST /compile-batch
///
/// Every multipart field carrying a file name is a project file placed at
/// that (relative) path; `main_filename` is the optional hint.
pub async fn handle_compile_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ServerError> {
    let mut files = Vec::new();
    let mut main_filename: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        if let Some(path) = field.file_name().map(str::to_owned) {
            let contents = field.bytes().await.map_err(invalid_multipart)?;
            if path.is_empty() {
                continue;
            }
            files.push(ProjectFile::new(path, contents.to_vec()));
        } else if field.name() == Some("main_filename") {
            let text = field.text().await.map_err(invalid_multipart)?;
            if !text.trim().is_empty() {
                main_filename = Some(text);
            }
        } else {
            debug!("Ignoring multipart field {:?}", field.name());
        }
    }

    info!(
        "Compile batch request: {} files, main_filename={:?}",
        files.len(),
        main_filename
    );

    let outcome = state.compiler.compile_files(files, main_filename).await?;

    Ok(outcome_response(outcome, &state.engine_name()))
}

/// Handler: POST /compile-status
///
/// Always answers 200; failures are reported in the body.
pub async fn handle_compile_status(
    State(state): State<AppState>,
    Json(req): Json<CompileRequest>,
) -> Json<CompilationReport> {
    info!("Compile status request: filename={}", req.filename);
    Json(
        state
            .compiler
            .compile_inline_with_diagnostics(&req.content, &req.filename)
            .await,
    )
}

/// Handler: GET /cleanup
///
/// Sweeps workspaces older than the configured age and reports the result.
pub async fn handle_cleanup(
    State(state): State<AppState>,
) -> Result<Json<SweepStats>, ServerError> {
    let workspaces = state.compiler.workspaces().clone();
    let max_age = state.sweep_max_age;
    let stats = tokio::task::spawn_blocking(move || workspaces.sweep_stale(max_age))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    for err in &stats.errors {
        warn!("{}", err);
    }
    info!("Cleanup removed {} stale workspaces", stats.deleted_dirs);
    Ok(Json(stats))
}

fn invalid_multipart(err: axum::extract::multipart::MultipartError) -> ServerError {
    ServerError::InvalidRequest(format!("Invalid multipart body: {}", err))
}
