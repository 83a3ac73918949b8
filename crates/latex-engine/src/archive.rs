//! Project extraction and main document discovery
//!
//! An uploaded archive is validated in full (central directory, entry
//! paths, declared size) before a single byte is written. Only then is it
//! extracted into a workspace, with the actual decompressed size held to
//! the same limit. Loose file batches are written the same way. Then the
//! main document is picked:
//!
//! 1. the caller's hint, if it names an extracted file
//! 2. the first `main.tex` among the candidates
//! 3. the first candidate
//!
//! Candidates are `.tex` files, skipping anything under a hidden entry or an
//! archiver metadata directory such as `__MACOSX`. The walk is depth-first
//! with siblings in lexicographic order, so selection is reproducible
//! across platforms and filesystems.

use std::ffi::OsStr;
use std::io::{Cursor, Read, Seek};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::config::EngineConfig;
use crate::workspace::Workspace;

/// Extension of document source files
pub const SOURCE_EXTENSION: &str = "tex";

/// File name preferred when no hint is given
pub const MAIN_DOCUMENT: &str = "main.tex";

/// Directories archivers add that never hold project files
const METADATA_DIRS: &[&str] = &["__MACOSX"];

/// Archive problems
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("malformed archive: {0}")]
    Malformed(#[from] ZipError),

    #[error("unsafe archive entry path: {0}")]
    UnsafeEntry(String),

    #[error("archive too large: {0} bytes uncompressed")]
    TooLarge(u64),

    #[error("no document-source files found")]
    NoDocumentSource,

    #[error("no files uploaded")]
    NoFiles,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolveError {
    /// Client-facing reason, or `None` when the failure is on our side
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            ResolveError::Malformed(_) => Some("malformed archive"),
            ResolveError::UnsafeEntry(_) => Some("unsafe archive entry path"),
            ResolveError::TooLarge(_) => Some("archive too large"),
            ResolveError::NoDocumentSource => Some("no document-source files found"),
            ResolveError::NoFiles => Some("No files uploaded"),
            ResolveError::Io(_) => None,
        }
    }
}

/// An extracted project ready for compilation
#[derive(Debug)]
pub struct ResolvedProject {
    workspace: Workspace,
    main_document: PathBuf,
    working_directory: PathBuf,
}

impl ResolvedProject {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Absolute path of the selected main document
    pub fn main_document(&self) -> &Path {
        &self.main_document
    }

    /// Main document path relative to the workspace root
    pub fn main_document_relative(&self) -> &Path {
        self.main_document
            .strip_prefix(self.workspace.path())
            .unwrap_or(&self.main_document)
    }

    /// File name of the main document, as passed to the engine
    pub fn main_document_name(&self) -> &OsStr {
        self.main_document
            .file_name()
            .unwrap_or(self.main_document.as_os_str())
    }

    /// Directory containing the main document
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn into_workspace(self) -> Workspace {
        self.workspace
    }
}

/// One file of a loose project upload
#[derive(Debug, Clone)]
pub struct ProjectFile {
    /// Path relative to the project root, as sent by the client
    pub path: String,
    pub contents: Vec<u8>,
}

impl ProjectFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Validates, extracts and resolves uploaded projects
#[derive(Debug, Clone)]
pub struct ArchiveResolver {
    max_extracted_bytes: u64,
}

impl ArchiveResolver {
    pub fn new(max_extracted_bytes: u64) -> Self {
        Self {
            max_extracted_bytes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_extracted_bytes)
    }

    /// Validate `bytes`, extract them into `workspace` and pick the main document
    ///
    /// On error the workspace is dropped, and with it everything extracted.
    pub fn resolve(
        &self,
        bytes: &[u8],
        workspace: Workspace,
        main_file_hint: Option<&str>,
    ) -> Result<ResolvedProject, ResolveError> {
        self.open(Cursor::new(bytes))?
            .extract(workspace, main_file_hint)
    }

    /// Parse and check an archive without writing anything
    pub fn open<R: Read + Seek>(&self, reader: R) -> Result<ValidatedArchive<R>, ResolveError> {
        let mut archive = ZipArchive::new(reader)?;

        let mut entries = Vec::with_capacity(archive.len());
        let mut declared: u64 = 0;
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!("Rejecting archive entry with unsafe path: {}", entry.name());
                return Err(ResolveError::UnsafeEntry(entry.name().to_string()));
            };

            declared = declared.saturating_add(entry.size());
            if declared > self.max_extracted_bytes {
                return Err(ResolveError::TooLarge(declared));
            }

            entries.push(ArchiveEntry {
                index,
                relative,
                is_dir: entry.is_dir(),
            });
        }

        Ok(ValidatedArchive {
            archive,
            entries,
            max_extracted_bytes: self.max_extracted_bytes,
        })
    }

    /// Write loose project files into `workspace` and pick the main document
    ///
    /// Files whose path is absolute, empty or climbs out with `..` are
    /// skipped. At least one file must be written.
    pub fn resolve_files(
        &self,
        files: Vec<ProjectFile>,
        workspace: Workspace,
        main_file_hint: Option<&str>,
    ) -> Result<ResolvedProject, ResolveError> {
        let root = workspace.path().to_path_buf();

        let mut written = 0usize;
        let mut total: u64 = 0;
        for file in files {
            let Some(relative) = relative_path(&file.path) else {
                warn!("Skipping uploaded file with unsafe path: {:?}", file.path);
                continue;
            };

            total = total.saturating_add(file.contents.len() as u64);
            if total > self.max_extracted_bytes {
                return Err(ResolveError::TooLarge(total));
            }

            let target = root.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &file.contents)?;
            written += 1;
        }

        if written == 0 {
            return Err(ResolveError::NoFiles);
        }
        debug!("Wrote {} uploaded files into {}", written, root.display());

        into_project(workspace, main_file_hint)
    }
}

#[derive(Debug)]
struct ArchiveEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// An archive whose structure and entry paths have been checked
pub struct ValidatedArchive<R> {
    archive: ZipArchive<R>,
    entries: Vec<ArchiveEntry>,
    max_extracted_bytes: u64,
}

impl<R: Read + Seek> ValidatedArchive<R> {
    /// Number of entries, directories included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extract every entry into `workspace` and select the main document
    ///
    /// Entry sizes in the archive are not trusted: decompression stops as
    /// soon as the running total passes the limit.
    pub fn extract(
        mut self,
        workspace: Workspace,
        main_file_hint: Option<&str>,
    ) -> Result<ResolvedProject, ResolveError> {
        let root = workspace.path().to_path_buf();

        let mut remaining = self.max_extracted_bytes;
        for entry in &self.entries {
            let target = root.join(&entry.relative);
            if entry.is_dir {
                std::fs::create_dir_all(&target)?;
                continue;
            }

            let file = self.archive.by_index(entry.index)?;
            let mut contents = Vec::new();
            file.take(remaining.saturating_add(1))
                .read_to_end(&mut contents)
                .map_err(|e| ResolveError::Malformed(ZipError::Io(e)))?;

            let len = contents.len() as u64;
            if len > remaining {
                warn!(
                    "Archive entry {} exceeds the extraction limit",
                    entry.relative.display()
                );
                return Err(ResolveError::TooLarge(
                    self.max_extracted_bytes - remaining + len,
                ));
            }
            remaining -= len;

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
        }
        debug!(
            "Extracted {} archive entries into {}",
            self.entries.len(),
            root.display()
        );

        into_project(workspace, main_file_hint)
    }
}

fn into_project(
    workspace: Workspace,
    main_file_hint: Option<&str>,
) -> Result<ResolvedProject, ResolveError> {
    let root = workspace.path().to_path_buf();
    let main_document = select_main_document(&root, main_file_hint)?;
    let working_directory = main_document
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(root);
    debug!(
        "Selected main document {} (working directory {})",
        main_document.display(),
        working_directory.display()
    );

    Ok(ResolvedProject {
        workspace,
        main_document,
        working_directory,
    })
}

/// Pick the main document under `root`
pub fn select_main_document(root: &Path, hint: Option<&str>) -> Result<PathBuf, ResolveError> {
    if let Some(hint) = hint.filter(|hint| !hint.trim().is_empty()) {
        match relative_path(hint) {
            Some(relative) => {
                let hinted = root.join(relative);
                if hinted.is_file() {
                    return Ok(hinted);
                }
                debug!("Main file hint {} not found, falling back", hinted.display());
            }
            None => warn!("Ignoring unsafe main file hint: {}", hint),
        }
    }

    let candidates = find_document_sources(root);
    candidates
        .iter()
        .find(|path| path.file_name() == Some(OsStr::new(MAIN_DOCUMENT)))
        .or_else(|| candidates.first())
        .cloned()
        .ok_or(ResolveError::NoDocumentSource)
}

/// All `.tex` files under `root` outside hidden and metadata directories
pub fn find_document_sources(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry.file_name()))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension() == Some(OsStr::new(SOURCE_EXTENSION)))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn is_excluded(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') || METADATA_DIRS.contains(&name.as_ref())
}

/// Client-supplied path confined to the workspace, or `None`
fn relative_path(raw: &str) -> Option<&Path> {
    let path = Path::new(raw.trim());
    let mut named = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            _ => return None,
        }
    }
    named.then_some(path)
}
