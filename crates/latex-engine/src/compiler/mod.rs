//! Engine invocation with timeout and outcome classification

pub mod driver;
pub mod errors;
pub mod outcome;

pub use driver::{Driver, PassOutcome};
pub use errors::EngineError;
pub use outcome::{CompilationOutcome, CompilationReport};
