//! Per-request scratch directories
//!
//! Every compilation runs inside its own [`Workspace`]: a freshly created,
//! uniquely named directory that is removed with all of its contents when
//! the workspace is released or dropped. Dropping covers early returns,
//! errors, panics and cancelled futures alike.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use sysinfo::Disks;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

/// Creates workspaces under a common root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    prefix: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.workspace_root, &config.workspace_prefix)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create a fresh, empty workspace
    ///
    /// Names are `<prefix><random suffix>`, created with exclusive-create
    /// semantics so concurrent acquisitions never collide.
    pub fn acquire(&self) -> io::Result<Workspace> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.root)?;
        debug!("Acquired workspace {}", dir.path().display());
        Ok(Workspace { dir: Some(dir) })
    }

    /// Free bytes on the filesystem holding the workspace root
    ///
    /// `None` when no mounted disk contains the root.
    pub fn available_space(&self) -> Option<u64> {
        let root = self
            .root
            .ancestors()
            .find_map(|dir| dir.canonicalize().ok())
            .unwrap_or_else(|| self.root.clone());

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }

    /// Whether at least `min_bytes` are free under the root
    ///
    /// Zero disables the check. An unknown amount of free space passes.
    pub fn has_free_space(&self, min_bytes: u64) -> bool {
        if min_bytes == 0 {
            return true;
        }
        match self.available_space() {
            Some(available) if available < min_bytes => {
                warn!(
                    "Only {} bytes free under {}, {} required",
                    available,
                    self.root.display(),
                    min_bytes
                );
                false
            }
            Some(_) => true,
            None => {
                debug!("Free space under {} unknown", self.root.display());
                true
            }
        }
    }

    /// Remove workspaces left behind by a killed process
    ///
    /// Only directories directly under the root whose name starts with the
    /// workspace prefix and whose modification time is older than `max_age`
    /// are touched.
    pub fn sweep_stale(&self, max_age: Duration) -> SweepStats {
        let mut stats = SweepStats::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return stats,
            Err(e) => {
                stats
                    .errors
                    .push(format!("Error reading {}: {}", self.root.display(), e));
                return stats;
            }
        };

        let now = SystemTime::now();
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&self.prefix) {
                continue;
            }

            let path = entry.path();
            let is_stale = entry
                .metadata()
                .ok()
                .filter(|meta| meta.is_dir())
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if !is_stale {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => stats.deleted_dirs += 1,
                Err(e) => stats
                    .errors
                    .push(format!("Error cleaning {}: {}", name.to_string_lossy(), e)),
            }
        }

        if stats.deleted_dirs > 0 || !stats.errors.is_empty() {
            info!(
                "Swept {} stale workspaces ({} errors)",
                stats.deleted_dirs,
                stats.errors.len()
            );
        }
        stats
    }
}

/// Result of a stale workspace sweep
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepStats {
    pub deleted_dirs: usize,
    pub errors: Vec<String>,
}

/// An exclusively owned scratch directory
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        // `dir` is only taken by `close`, which consumes the workspace
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    /// Remove the directory and everything inside it
    ///
    /// Failures are logged, never returned: the caller's outcome wins.
    pub fn release(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Released workspace {}", path.display()),
                Err(e) => warn!("Failed to remove workspace {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.close();
    }
}
