//! Shared types for the Ferrule compiler.
//!
//! This crate defines the AST node types handed to the backend, source
//! spans, and the user-facing diagnostic types.

mod error;
mod span;
pub mod ast;

pub use error::{CompileErrors, ErrorCategory, ErrorCode, FerruleError, Severity, MAX_ERRORS};
pub use span::{SourceFile, Span};

/// Result type used for user-facing diagnostics.
pub type Result<T> = std::result::Result<T, FerruleError>;
