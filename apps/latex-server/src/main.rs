//! LaTeX Compilation Server
//!
//! An HTTP front for `pdflatex`. Provides REST API endpoints for:
//!
//! - Compiling inline LaTeX source to PDF
//! - Compiling zipped multi-file projects to PDF
//! - Compiling projects uploaded as loose files
//! - Compilation status reports with the full engine log
//! - On-demand removal of stale workspaces
//!
//! ## Architecture
//!
//! Handlers are thin: every request goes through `latex_engine::LatexCompiler`,
//! which owns workspace isolation, archive resolution and the two-pass
//! engine run. This binary adds:
//!
//! - Configuration from flags, environment and `.env`
//! - Request tracing and CORS
//! - Upload size limits
//! - Periodic removal of workspaces orphaned by a killed process

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use latex_engine::{EngineConfig, LatexCompiler};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod error;

use api::{
    handle_cleanup, handle_compile, handle_compile_batch, handle_compile_status,
    handle_compile_zip, handle_health,
};

/// Command-line arguments for the LaTeX server
#[derive(Parser, Debug)]
#[command(name = "latex-server")]
#[command(about = "HTTP service compiling LaTeX to PDF")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Engine binary
    #[arg(long, env = "LATEX_ENGINE", default_value = "pdflatex")]
    engine: PathBuf,

    /// Timeout for each compilation pass in seconds
    #[arg(long, env = "LATEX_PASS_TIMEOUT_SECS", default_value = "30")]
    pass_timeout_secs: u64,

    /// Timeout for the engine availability probe in seconds
    #[arg(long, env = "LATEX_PROBE_TIMEOUT_SECS", default_value = "5")]
    probe_timeout_secs: u64,

    /// Maximum compilations running at once
    #[arg(long, env = "LATEX_MAX_CONCURRENT", default_value = "10")]
    max_concurrent: usize,

    /// Directory for per-request workspaces (defaults to the system temp dir)
    #[arg(long, env = "LATEX_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Maximum request body size in MiB
    #[arg(long, env = "LATEX_MAX_UPLOAD_MB", default_value = "50")]
    max_upload_mb: usize,

    /// Maximum uncompressed archive or batch size in MiB
    #[arg(long, env = "LATEX_MAX_EXTRACTED_MB", default_value = "256")]
    max_extracted_mb: u64,

    /// Free space in MiB required on the workspace filesystem for uploads (0 disables)
    #[arg(long, env = "LATEX_MIN_FREE_MB", default_value = "1024")]
    min_free_mb: u64,

    /// Seconds between stale workspace sweeps (0 sweeps at startup only)
    #[arg(long, env = "LATEX_SWEEP_INTERVAL_SECS", default_value = "600")]
    sweep_interval_secs: u64,

    /// Age in seconds after which a leftover workspace is removed
    #[arg(long, env = "LATEX_SWEEP_MAX_AGE_SECS", default_value = "3600")]
    sweep_max_age_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_program(&self.engine)
            .with_pass_timeout(Duration::from_secs(self.pass_timeout_secs));
        config.probe_timeout = Duration::from_secs(self.probe_timeout_secs);
        config.max_concurrent = self.max_concurrent;
        config.max_extracted_bytes = self.max_extracted_mb * 1024 * 1024;
        config.min_free_bytes = self.min_free_mb * 1024 * 1024;
        if let Some(root) = &self.workspace_root {
            config.workspace_root = root.clone();
        }
        config
    }
}

/// Age after which `/cleanup` removes a workspace
pub const DEFAULT_SWEEP_MAX_AGE: Duration = Duration::from_secs(3600);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub compiler: LatexCompiler,
    pub sweep_max_age: Duration,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            compiler: LatexCompiler::new(config),
            sweep_max_age: DEFAULT_SWEEP_MAX_AGE,
        }
    }

    pub fn with_sweep_max_age(mut self, max_age: Duration) -> Self {
        self.sweep_max_age = max_age;
        self
    }

    /// Engine name used in error messages
    pub fn engine_name(&self) -> String {
        self.compiler.config().program_name()
    }
}

/// Build the router with all routes and middleware
pub fn app(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handle_health))
        // Compilation endpoints
        .route("/compile", post(handle_compile))
        .route("/compile-zip", post(handle_compile_zip))
        .route("/compile-batch", post(handle_compile_batch))
        .route("/compile-status", post(handle_compile_status))
        // Maintenance
        .route("/cleanup", get(handle_cleanup))
        // Apply middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .with_state(state)
}

/// Remove orphaned workspaces now and then every `interval`
fn spawn_workspace_sweeper(compiler: LatexCompiler, interval: Duration, max_age: Duration) {
    tokio::spawn(async move {
        let mut ticker = (!interval.is_zero()).then(|| tokio::time::interval(interval));
        loop {
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }

            let workspaces = compiler.workspaces().clone();
            match tokio::task::spawn_blocking(move || workspaces.sweep_stale(max_age)).await {
                Ok(stats) => {
                    for err in stats.errors {
                        warn!("{}", err);
                    }
                }
                Err(e) => warn!("Workspace sweep failed: {}", e),
            }

            if ticker.is_none() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LaTeX server on {}:{}", args.host, args.port);

    let sweep_max_age = Duration::from_secs(args.sweep_max_age_secs);
    let state = AppState::new(args.engine_config()).with_sweep_max_age(sweep_max_age);

    if state.compiler.probe_engine_availability().await {
        info!("Engine {} is available", state.engine_name());
    } else {
        warn!(
            "Engine {} is not available; compile requests will fail until it is installed",
            state.engine_name()
        );
    }

    spawn_workspace_sweeper(
        state.compiler.clone(),
        Duration::from_secs(args.sweep_interval_secs),
        sweep_max_age,
    );

    let app = app(state, args.max_upload_mb * 1024 * 1024);

    // Start server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Pass timeout: {}s", args.pass_timeout_secs);
    info!("Max concurrent compilations: {}", args.max_concurrent);

    axum::serve(listener, app).await?;

    Ok(())
}
