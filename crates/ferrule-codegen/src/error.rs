//! Codegen error types.

use ferrule_types::{CompileErrors, FerruleError};
use thiserror::Error;

use crate::binary::EncodeError;
use crate::latent::LatentError;
use crate::stack::StackError;

/// Errors that can occur during WASM code generation.
///
/// Only [`CodegenError::Semantic`] and [`CodegenError::Diagnostics`] describe
/// mistakes in the user's program. Every other variant is a defect in the
/// backend and aborts the compilation unit.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// User-facing diagnostics raised while compiling one function.
    #[error("{}", join_diagnostics(.0))]
    Semantic(Vec<FerruleError>),

    /// The batch of user-facing diagnostics for the whole unit.
    #[error("compilation failed: {0}")]
    Diagnostics(CompileErrors),

    /// A stack-frame allocator invariant was violated.
    #[error("internal stack allocator error: {0}")]
    Stack(#[from] StackError),

    /// A value could not be represented in the binary format.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodeError),

    /// A deferred index or offset was misused.
    #[error("latent value error: {0}")]
    Latent(#[from] LatentError),

    /// An internal consistency check failed.
    #[error("internal codegen error: {0}")]
    Internal(String),

    /// The generated WASM module failed validation.
    #[error("WASM validation failed: {0}")]
    ValidationFailed(String),

    /// Too many locals, functions, or other entities exceeded WASM limits.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

impl CodegenError {
    /// Wrap a single diagnostic.
    pub fn semantic(error: FerruleError) -> Self {
        Self::Semantic(vec![error])
    }

    /// Whether this error reports a mistake in the user's program (and so
    /// should be accumulated rather than abort compilation).
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::Semantic(_) | Self::Diagnostics(_))
    }
}

fn join_diagnostics(errors: &[FerruleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Codegen result type alias.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Convert a host-side length into a `u32` count, failing on overflow.
pub(crate) fn ensure_u32(value: usize, what: &str) -> CodegenResult<u32> {
    u32::try_from(value).map_err(|_| CodegenError::LimitExceeded(format!("{what}: {value}")))
}
