//! Two-pass engine driver
//!
//! This module runs the external engine as a subprocess with a hard
//! wall-clock limit per pass and classifies what happened. Subprocesses are
//! spawned with `kill_on_drop`, so a pass that times out, or whose request
//! is cancelled, is killed rather than left running.

use std::ffi::OsString;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::errors::EngineError;
use super::outcome::{excerpt, CompilationOutcome};
use crate::config::EngineConfig;

/// What one engine invocation did
#[derive(Debug)]
pub enum PassOutcome {
    /// The process ran to completion
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    /// The pass hit its timeout and the process was killed
    TimedOut,
    /// The process could not be started
    SpawnFailed(std::io::Error),
    /// The process started but collecting its output failed
    WaitFailed(std::io::Error),
}

/// Captured output of the most recent completed pass
#[derive(Debug, Default)]
struct PassLog {
    stdout: String,
    stderr: String,
}

/// Invokes the engine against documents on disk
#[derive(Debug, Clone)]
pub struct Driver {
    config: EngineConfig,
}

impl Driver {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.program_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Check that the engine runs, via `--version` under the probe timeout
    pub async fn probe(&self) -> bool {
        let mut cmd = self.command();
        cmd.arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match timeout(self.config.probe_timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("{} probe failed: {}", self.config.program_name(), e);
                false
            }
            Err(_) => {
                warn!(
                    "{} probe timed out after {:?}",
                    self.config.program_name(),
                    self.config.probe_timeout
                );
                false
            }
        }
    }

    /// Run one non-interactive pass over `main_document` inside `working_dir`
    pub async fn run_pass(
        &self,
        working_dir: &Path,
        main_document: &Path,
        pass_timeout: Duration,
    ) -> PassOutcome {
        let mut cmd = self.command();
        cmd.arg("-interaction=nonstopmode")
            .arg("-output-directory")
            .arg(working_dir)
            .arg(document_arg(main_document))
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return PassOutcome::SpawnFailed(e),
        };

        // Dropping the pending wait on timeout drops the child, which kills it
        match timeout(pass_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => PassOutcome::Exited {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => PassOutcome::WaitFailed(e),
            Err(_) => PassOutcome::TimedOut,
        }
    }

    /// Compile `main_document` (relative to `working_dir`) to PDF
    ///
    /// The first pass must exit zero. A second, identical pass then settles
    /// cross-references; its exit status is ignored. The artifact is
    /// `<main document stem>.pdf` in `working_dir`.
    pub async fn compile(
        &self,
        working_dir: &Path,
        main_document: &Path,
        pass_timeout: Duration,
    ) -> Result<CompilationOutcome, EngineError> {
        let program = self.config.program_name();

        info!("Running {} (first pass) on {}", program, main_document.display());
        let first = self.run_pass(working_dir, main_document, pass_timeout).await;
        if let ControlFlow::Break(outcome) = self.settle(first, true)? {
            return Ok(outcome);
        }

        info!("Running {} (second pass) on {}", program, main_document.display());
        let second = self.run_pass(working_dir, main_document, pass_timeout).await;
        let log = match self.settle(second, false)? {
            ControlFlow::Break(outcome) => return Ok(outcome),
            ControlFlow::Continue(log) => log,
        };

        let artifact_path = artifact_path(working_dir, main_document);
        let artifact_name = artifact_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match tokio::fs::read(&artifact_path).await {
            Ok(artifact) => {
                info!("Read compiled PDF {} ({} bytes)", artifact_name, artifact.len());
                Ok(CompilationOutcome::Success {
                    artifact,
                    artifact_name,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("PDF file was not created: {}", artifact_path.display());
                Ok(CompilationOutcome::ArtifactMissing {
                    stdout_excerpt: excerpt(&log.stdout, self.config.excerpt_chars),
                    stderr_excerpt: excerpt(&log.stderr, self.config.excerpt_chars),
                })
            }
            Err(e) => Err(EngineError::IoError(e)),
        }
    }

    /// Decide whether compilation continues after a pass
    fn settle(
        &self,
        pass: PassOutcome,
        require_success: bool,
    ) -> Result<ControlFlow<CompilationOutcome, PassLog>, EngineError> {
        let max = self.config.excerpt_chars;
        match pass {
            PassOutcome::Exited {
                status,
                stdout,
                stderr,
            } => {
                if status.success() {
                    return Ok(ControlFlow::Continue(PassLog { stdout, stderr }));
                }
                if require_success {
                    error!("First pass failed ({}): {}", status, excerpt(&stderr, 200));
                    return Ok(ControlFlow::Break(CompilationOutcome::CompilationFailed {
                        stdout_excerpt: excerpt(&stdout, max),
                        stderr_excerpt: excerpt(&stderr, max),
                    }));
                }
                debug!("Second pass exited with {}, continuing", status);
                Ok(ControlFlow::Continue(PassLog { stdout, stderr }))
            }
            PassOutcome::TimedOut => {
                warn!("Pass exceeded timeout, process killed");
                Ok(ControlFlow::Break(CompilationOutcome::Timeout))
            }
            PassOutcome::SpawnFailed(e) => {
                error!("Failed to start {}: {}", self.config.program_name(), e);
                Ok(ControlFlow::Break(CompilationOutcome::EngineUnavailable))
            }
            PassOutcome::WaitFailed(e) => Err(EngineError::IoError(e)),
        }
    }
}

/// Path of the PDF the engine writes for `main_document`
pub fn artifact_path(working_dir: &Path, main_document: &Path) -> PathBuf {
    working_dir.join(main_document).with_extension("pdf")
}

/// Engine argument naming the document; a leading `-` would read as a flag
fn document_arg(main_document: &Path) -> OsString {
    if main_document.as_os_str().to_string_lossy().starts_with('-') {
        Path::new(".").join(main_document).into_os_string()
    } else {
        main_document.as_os_str().to_os_string()
    }
}
