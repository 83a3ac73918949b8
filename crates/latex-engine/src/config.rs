//! Engine and workspace configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default engine binary
pub const DEFAULT_PROGRAM: &str = "pdflatex";

/// Default wall-clock budget for one engine pass
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget for the `--version` availability probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Characters of stdout/stderr kept in failure excerpts
pub const DEFAULT_EXCERPT_CHARS: usize = 500;

/// Compilations allowed to hold a workspace at the same time
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Upper bound on the declared uncompressed size of an uploaded archive
pub const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 256 * 1024 * 1024;

/// Free space required on the workspace filesystem before accepting an upload
pub const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;

/// Name prefix of every workspace directory
pub const DEFAULT_WORKSPACE_PREFIX: &str = "latex-";

/// Configuration shared by the driver, the resolver and the workspace manager
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine binary (looked up on `PATH` when not absolute)
    pub program: PathBuf,
    /// Arguments placed before the engine flags on every invocation
    pub program_args: Vec<String>,
    /// Timeout applied to each compilation pass
    pub pass_timeout: Duration,
    /// Timeout applied to the availability probe
    pub probe_timeout: Duration,
    /// Length of stdout/stderr excerpts in failure outcomes
    pub excerpt_chars: usize,
    /// Maximum number of compilations in flight
    pub max_concurrent: usize,
    /// Maximum uncompressed size of an archive or file batch
    pub max_extracted_bytes: u64,
    /// Free space required under `workspace_root` for uploads (0 disables the check)
    pub min_free_bytes: u64,
    /// Directory under which workspaces are created
    pub workspace_root: PathBuf,
    /// Prefix for workspace directory names
    pub workspace_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            program_args: Vec::new(),
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            workspace_root: std::env::temp_dir(),
            workspace_prefix: DEFAULT_WORKSPACE_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    /// Use a different engine binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Prepend arguments to every engine invocation
    pub fn with_program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-pass timeout
    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Create workspaces under `root`
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Require `bytes` of free space before accepting uploads
    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    /// Display name of the engine, used in log lines and messages
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}
