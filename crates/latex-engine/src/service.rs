//! Boundary operations used by the HTTP layer
//!
//! [`LatexCompiler`] strings the pieces together: probe the engine, check
//! free space for uploads, wait for a compilation slot, acquire a workspace,
//! optionally resolve an uploaded project, drive the engine, release the
//! workspace. The workspace is released on
//! every path out, including errors and dropped futures.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{error, info, warn};

use crate::archive::{ArchiveResolver, ProjectFile, ResolveError, ResolvedProject};
use crate::compiler::driver::artifact_path;
use crate::compiler::{CompilationOutcome, CompilationReport, Driver, EngineError, PassOutcome};
use crate::config::EngineConfig;
use crate::workspace::WorkspaceManager;

/// Reason given for a rejected inline document name
pub const INVALID_DOCUMENT_NAME: &str = "invalid document name";

/// Compiles inline sources and zipped projects
#[derive(Debug, Clone)]
pub struct LatexCompiler {
    driver: Driver,
    resolver: ArchiveResolver,
    workspaces: Arc<WorkspaceManager>,
    permits: Arc<Semaphore>,
}

impl LatexCompiler {
    pub fn new(config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            resolver: ArchiveResolver::from_config(&config),
            workspaces: Arc::new(WorkspaceManager::from_config(&config)),
            driver: Driver::new(config),
            permits,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.driver.config()
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Whether the engine binary can be run right now
    pub async fn probe_engine_availability(&self) -> bool {
        self.driver.probe().await
    }

    /// Compile a single document given as source text
    ///
    /// `document_name` is the file stem: the source is written to
    /// `<name>.tex` and the artifact is `<name>.pdf`.
    pub async fn compile_inline(
        &self,
        source: &str,
        document_name: &str,
    ) -> Result<CompilationOutcome, EngineError> {
        if !is_valid_document_name(document_name) {
            warn!("Rejecting document name {:?}", document_name);
            return Ok(CompilationOutcome::invalid_input(INVALID_DOCUMENT_NAME));
        }
        if !self.probe_engine_availability().await {
            error!("{} not available", self.config().program_name());
            return Ok(CompilationOutcome::EngineUnavailable);
        }

        let _permit = self.acquire_slot().await?;
        let workspace = self.workspaces.acquire().map_err(EngineError::Workspace)?;

        let main_document = PathBuf::from(format!("{}.tex", document_name));
        let tex_file = workspace.path().join(&main_document);
        info!("Writing LaTeX content to {}", tex_file.display());
        tokio::fs::write(&tex_file, source).await?;

        let outcome = self
            .driver
            .compile(workspace.path(), &main_document, self.config().pass_timeout)
            .await;
        workspace.release();

        log_outcome("inline", &outcome);
        outcome
    }

    /// Compile a zipped project
    ///
    /// The archive is validated before any workspace is created, so a
    /// malformed upload never touches the disk.
    pub async fn compile_archive(
        &self,
        archive: Vec<u8>,
        main_file_hint: Option<String>,
    ) -> Result<CompilationOutcome, EngineError> {
        if let Some(outcome) = self.check_upload_preconditions().await? {
            return Ok(outcome);
        }

        let _permit = self.acquire_slot().await?;

        let resolver = self.resolver.clone();
        let workspaces = Arc::clone(&self.workspaces);
        let resolved = tokio::task::spawn_blocking(move || {
            let validated = resolver.open(Cursor::new(archive))?;
            let workspace = workspaces.acquire()?;
            validated.extract(workspace, main_file_hint.as_deref())
        })
        .await?;

        let outcome = self.compile_project(resolved).await;
        log_outcome("archive", &outcome);
        outcome
    }

    /// Compile a project uploaded as loose files
    ///
    /// Each file's path is taken relative to the project root; unsafe paths
    /// are skipped.
    pub async fn compile_files(
        &self,
        files: Vec<ProjectFile>,
        main_file_hint: Option<String>,
    ) -> Result<CompilationOutcome, EngineError> {
        if files.is_empty() {
            return Ok(CompilationOutcome::invalid_input(
                ResolveError::NoFiles.reason().unwrap_or_default(),
            ));
        }
        if let Some(outcome) = self.check_upload_preconditions().await? {
            return Ok(outcome);
        }

        let _permit = self.acquire_slot().await?;

        let resolver = self.resolver.clone();
        let workspaces = Arc::clone(&self.workspaces);
        let resolved = tokio::task::spawn_blocking(move || {
            let workspace = workspaces.acquire()?;
            resolver.resolve_files(files, workspace, main_file_hint.as_deref())
        })
        .await?;

        let outcome = self.compile_project(resolved).await;
        log_outcome("batch", &outcome);
        outcome
    }

    /// Engine availability, then free space for the upload
    async fn check_upload_preconditions(
        &self,
    ) -> Result<Option<CompilationOutcome>, EngineError> {
        if !self.probe_engine_availability().await {
            error!("{} not available", self.config().program_name());
            return Ok(Some(CompilationOutcome::EngineUnavailable));
        }

        let min_free_bytes = self.config().min_free_bytes;
        if min_free_bytes > 0 {
            let workspaces = Arc::clone(&self.workspaces);
            let enough =
                tokio::task::spawn_blocking(move || workspaces.has_free_space(min_free_bytes))
                    .await?;
            if !enough {
                return Ok(Some(CompilationOutcome::InsufficientStorage));
            }
        }
        Ok(None)
    }

    async fn compile_project(
        &self,
        resolved: Result<ResolvedProject, ResolveError>,
    ) -> Result<CompilationOutcome, EngineError> {
        let project = match resolved {
            Ok(project) => project,
            Err(ResolveError::Io(e)) => return Err(EngineError::IoError(e)),
            Err(err) => {
                warn!("Rejecting upload: {}", err);
                let reason = err.reason().unwrap_or("invalid upload");
                return Ok(CompilationOutcome::invalid_input(reason));
            }
        };

        info!("Compiling {}", project.main_document_relative().display());
        let main_document = Path::new(project.main_document_name()).to_path_buf();
        let outcome = self
            .driver
            .compile(
                project.working_directory(),
                &main_document,
                self.config().pass_timeout,
            )
            .await;
        project.into_workspace().release();
        outcome
    }

    /// Compile once and report status and the full engine log
    ///
    /// Never fails: every problem, the engine being missing included, is a
    /// report with `success: false`.
    pub async fn compile_inline_with_diagnostics(
        &self,
        source: &str,
        document_name: &str,
    ) -> CompilationReport {
        match self.diagnose(source, document_name).await {
            Ok(report) => report,
            Err(e) => {
                error!("Compilation error: {}", e);
                CompilationReport::failure(format!("Error: {}", e))
            }
        }
    }

    async fn diagnose(
        &self,
        source: &str,
        document_name: &str,
    ) -> Result<CompilationReport, EngineError> {
        if !is_valid_document_name(document_name) {
            return Ok(CompilationReport::failure(format!(
                "Error: {}",
                INVALID_DOCUMENT_NAME
            )));
        }
        if !self.probe_engine_availability().await {
            return Ok(CompilationReport::failure(format!(
                "{} not available",
                self.config().program_name()
            )));
        }

        let _permit = self.acquire_slot().await?;
        let workspace = self.workspaces.acquire().map_err(EngineError::Workspace)?;

        let main_document = PathBuf::from(format!("{}.tex", document_name));
        tokio::fs::write(workspace.path().join(&main_document), source).await?;

        let pass = self
            .driver
            .run_pass(workspace.path(), &main_document, self.config().pass_timeout)
            .await;

        let report = match pass {
            PassOutcome::Exited {
                status,
                stdout,
                stderr,
            } => {
                let pdf_exists =
                    tokio::fs::try_exists(artifact_path(workspace.path(), &main_document))
                        .await
                        .unwrap_or(false);
                let success = status.success() && pdf_exists;
                CompilationReport {
                    success,
                    message: format!(
                        "Compilation {}",
                        if success { "successful" } else { "failed" }
                    ),
                    log: format!("{}\n{}", stdout, stderr),
                }
            }
            PassOutcome::TimedOut => CompilationReport::failure("Compilation timeout"),
            PassOutcome::SpawnFailed(_) => CompilationReport::failure(format!(
                "{} not available",
                self.config().program_name()
            )),
            PassOutcome::WaitFailed(e) => return Err(EngineError::IoError(e)),
        };
        workspace.release();

        Ok(report)
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, EngineError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| EngineError::QueueClosed)
    }
}

/// A plain file stem: no separators, no parent references, no leading
/// dash, no control characters
pub fn is_valid_document_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.starts_with('-')
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}

fn log_outcome(kind: &str, outcome: &Result<CompilationOutcome, EngineError>) {
    match outcome {
        Ok(outcome) => info!("Finished {} compilation: {}", kind, outcome.label()),
        Err(e) => error!("Compilation error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{entries_under, missing_engine_config, zip_bytes, FakeEngine};

    const HELLO: &str = r"\documentclass{article}\begin{document}Hello\end{document}";

    #[test]
    fn test_document_name_validation() {
        assert!(is_valid_document_name("doc"));
        assert!(is_valid_document_name("my-report_v2"));
        assert!(!is_valid_document_name(""));
        assert!(!is_valid_document_name("../etc/passwd"));
        assert!(!is_valid_document_name("dir/doc"));
        assert!(!is_valid_document_name("dir\\doc"));
        assert!(!is_valid_document_name("-shell-escape"));
        assert!(!is_valid_document_name("a\nb"));
        assert!(!is_valid_document_name("a\rb"));
        assert!(!is_valid_document_name("tab\tname"));
        assert!(!is_valid_document_name("nul\0name"));
        assert!(is_valid_document_name("my report; v2"));
        assert!(is_valid_document_name("résumé"));
    }

    #[tokio::test]
    async fn test_inline_success_named_after_document() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let outcome = compiler.compile_inline(HELLO, "doc").await.unwrap();

        match outcome {
            CompilationOutcome::Success {
                artifact,
                artifact_name,
            } => {
                assert!(artifact.starts_with(b"%PDF"));
                assert_eq!(artifact_name, "doc.pdf");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_inline_failure_cleans_workspace() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let outcome = compiler
            .compile_inline("\\begin{document} FAKE-REJECT", "doc")
            .await
            .unwrap();

        assert!(matches!(outcome, CompilationOutcome::CompilationFailed { .. }));
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_inline_timeout_cleans_workspace() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let config = engine
            .config(root.path())
            .with_pass_timeout(std::time::Duration::from_millis(300));
        let compiler = LatexCompiler::new(config);

        let outcome = compiler.compile_inline("FAKE-SLOW", "doc").await.unwrap();

        assert_eq!(outcome, CompilationOutcome::Timeout);
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_invalid_document_name_rejected() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let outcome = compiler.compile_inline(HELLO, "../escape").await.unwrap();
        assert_eq!(
            outcome,
            CompilationOutcome::invalid_input(INVALID_DOCUMENT_NAME)
        );
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_unavailable_engine_touches_no_workspace() {
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(missing_engine_config(root.path()));

        assert!(!compiler.probe_engine_availability().await);

        let inline = compiler.compile_inline(HELLO, "doc").await.unwrap();
        assert_eq!(inline, CompilationOutcome::EngineUnavailable);

        let archive = zip_bytes(&[("main.tex", HELLO.as_bytes())]);
        let zipped = compiler.compile_archive(archive, None).await.unwrap();
        assert_eq!(zipped, CompilationOutcome::EngineUnavailable);

        let report = compiler.compile_inline_with_diagnostics(HELLO, "doc").await;
        assert!(!report.success);
        assert_eq!(report.message, "pdflatex-missing not available");

        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_archive_nested_project() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let archive = zip_bytes(&[
            ("src/main.tex", HELLO.as_bytes()),
            ("img/logo.png", b"\x89PNGfakeimage"),
        ]);
        let outcome = compiler.compile_archive(archive, None).await.unwrap();

        match outcome {
            CompilationOutcome::Success { artifact_name, .. } => {
                assert_eq!(artifact_name, "main.pdf");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_archive_hint_names_artifact() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let archive = zip_bytes(&[
            ("paper.tex", HELLO.as_bytes()),
            ("other.tex", b"FAKE-REJECT"),
        ]);
        let outcome = compiler
            .compile_archive(archive, Some("paper.tex".to_string()))
            .await
            .unwrap();

        match outcome {
            CompilationOutcome::Success { artifact_name, .. } => {
                assert_eq!(artifact_name, "paper.pdf");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_archive_upload_is_invalid_input() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let outcome = compiler
            .compile_archive(b"not a zip".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(outcome, CompilationOutcome::invalid_input("malformed archive"));
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_archive_without_sources_is_invalid_input() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let archive = zip_bytes(&[("__MACOSX/main.tex", HELLO.as_bytes())]);
        let outcome = compiler.compile_archive(archive, None).await.unwrap();

        assert_eq!(
            outcome,
            CompilationOutcome::invalid_input("no document-source files found")
        );
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_diagnostics_report_success_and_log() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let report = compiler.compile_inline_with_diagnostics(HELLO, "doc").await;

        assert!(report.success);
        assert_eq!(report.message, "Compilation successful");
        assert!(report.log.contains("processing doc.tex"));
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_diagnostics_report_failure_with_full_log() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let report = compiler
            .compile_inline_with_diagnostics("FAKE-REJECT", "doc")
            .await;

        assert!(!report.success);
        assert_eq!(report.message, "Compilation failed");
        assert!(report.log.contains("Undefined control sequence"));
        assert!(report.log.contains("emergency stop"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_isolated() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let compiler = compiler.clone();
                tokio::spawn(async move {
                    compiler
                        .compile_inline(HELLO, &format!("doc{}", i))
                        .await
                        .unwrap()
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            match task.await.unwrap() {
                CompilationOutcome::Success { artifact_name, .. } => {
                    assert_eq!(artifact_name, format!("doc{}.pdf", i));
                }
                other => panic!("expected success, got {:?}", other),
            }
        }
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_control_characters_in_name_rejected() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let outcome = compiler.compile_inline(HELLO, "a\nb").await.unwrap();
        assert_eq!(
            outcome,
            CompilationOutcome::invalid_input(INVALID_DOCUMENT_NAME)
        );
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_files_batch_compiles_nested_main() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let files = vec![
            ProjectFile::new("thesis/main.tex", HELLO),
            ProjectFile::new("thesis/chapters/one.tex", "FAKE-REJECT"),
            ProjectFile::new("../outside.tex", HELLO),
        ];
        let outcome = compiler.compile_files(files, None).await.unwrap();

        match outcome {
            CompilationOutcome::Success { artifact_name, .. } => {
                assert_eq!(artifact_name, "main.pdf");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_files_batch_hint_and_empty_upload() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let files = vec![
            ProjectFile::new("main.tex", "FAKE-REJECT"),
            ProjectFile::new("paper.tex", HELLO),
        ];
        let outcome = compiler
            .compile_files(files, Some("paper.tex".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompilationOutcome::Success { ref artifact_name, .. } if artifact_name == "paper.pdf"
        ));

        let empty = compiler.compile_files(Vec::new(), None).await.unwrap();
        assert_eq!(empty, CompilationOutcome::invalid_input("No files uploaded"));

        let unsafe_only = vec![ProjectFile::new("/etc/passwd", "x")];
        let rejected = compiler.compile_files(unsafe_only, None).await.unwrap();
        assert_eq!(rejected, CompilationOutcome::invalid_input("No files uploaded"));
        assert_eq!(entries_under(root.path()), 0);
    }

    #[tokio::test]
    async fn test_uploads_refused_when_disk_is_short() {
        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler =
            LatexCompiler::new(engine.config(root.path()).with_min_free_bytes(u64::MAX));
        if compiler.workspaces().available_space().is_none() {
            return;
        }

        let archive = zip_bytes(&[("main.tex", HELLO.as_bytes())]);
        let zipped = compiler.compile_archive(archive, None).await.unwrap();
        assert_eq!(zipped, CompilationOutcome::InsufficientStorage);

        let files = vec![ProjectFile::new("main.tex", HELLO)];
        let batch = compiler.compile_files(files, None).await.unwrap();
        assert_eq!(batch, CompilationOutcome::InsufficientStorage);

        // Inline sources are small and skip the check
        let inline = compiler.compile_inline(HELLO, "doc").await.unwrap();
        assert!(inline.is_success());
        assert_eq!(entries_under(root.path()), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelled_request_kills_engine_and_releases_workspace() {
        use crate::testing::{engine_pid, process_gone};

        let engine = FakeEngine::new();
        let root = tempfile::tempdir().unwrap();
        let compiler = LatexCompiler::new(engine.config(root.path()));

        let task = tokio::spawn({
            let compiler = compiler.clone();
            async move { compiler.compile_inline("FAKE-SLOW", "doc").await }
        });

        let pid = engine_pid(root.path()).await;
        assert_eq!(entries_under(root.path()), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(entries_under(root.path()), 0);
        assert!(process_gone(pid).await, "engine process {} still running", pid);
    }
}
