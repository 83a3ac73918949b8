//! LaTeX compilation orchestration
//!
//! This crate turns an inbound compilation request (inline source or a
//! zipped multi-file project) into an isolated build directory, drives an
//! external `pdflatex`-compatible engine over it, and classifies the result:
//! - Workspace isolation with guaranteed cleanup
//! - Archive extraction, loose file uploads and main document discovery
//! - Two-pass engine invocation with per-pass timeouts
//!
//! The engine itself is an external subprocess; nothing here understands
//! LaTeX. Every expected failure mode is a [`CompilationOutcome`] variant so
//! that callers can map it onto their transport with a total function.

pub mod archive;
pub mod compiler;
pub mod config;
pub mod service;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{ArchiveResolver, ProjectFile, ResolveError, ResolvedProject};
pub use compiler::{CompilationOutcome, CompilationReport, Driver, EngineError, PassOutcome};
pub use config::EngineConfig;
pub use service::LatexCompiler;
pub use workspace::{SweepStats, Workspace, WorkspaceManager};
