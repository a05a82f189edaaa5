use crate::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of errors stored before the rest are only counted.
pub const MAX_ERRORS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Error category, determined by error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Type,
    Scope,
    Ownership,
    Structure,
    Unsupported,
}

/// Numeric error code (E200–E699).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // ── Type errors (E200–E299) ──
    pub const UNKNOWN_TYPE: Self = Self(200);
    pub const TYPE_MISMATCH: Self = Self(201);
    pub const WRONG_ARG_COUNT: Self = Self(202);
    pub const NOT_A_STRUCT: Self = Self(203);
    pub const UNKNOWN_FIELD: Self = Self(204);
    pub const MISSING_VALUE: Self = Self(205);
    pub const INVALID_OPERAND: Self = Self(206);

    // ── Scope errors (E300–E399) ──
    pub const UNRESOLVED_NAME: Self = Self(300);
    pub const DUPLICATE_DECLARATION: Self = Self(301);
    pub const UNKNOWN_FUNCTION: Self = Self(302);
    pub const INVALID_ASSIGNMENT_TARGET: Self = Self(303);

    // ── Ownership errors (E400–E499) ──
    pub const INCOMPLETE_VALUE: Self = Self(410);
    pub const CONSUMED_VALUE: Self = Self(411);
    pub const MOVE_OUT_OF_LOAN: Self = Self(412);

    // ── Structure errors (E500–E599) ──
    pub const RECURSIVE_STRUCT: Self = Self(500);
    pub const DUPLICATE_FIELD: Self = Self(501);
    pub const STRUCT_TOO_LARGE: Self = Self(502);

    // ── Unsupported constructs (E600–E699) ──
    pub const UNSUPPORTED: Self = Self(600);

    pub fn category(self) -> ErrorCategory {
        match self.0 {
            200..=299 => ErrorCategory::Type,
            300..=399 => ErrorCategory::Scope,
            400..=499 => ErrorCategory::Ownership,
            500..=599 => ErrorCategory::Structure,
            _ => ErrorCategory::Unsupported,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// A structured, user-facing compiler diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FerruleError {
    pub file: String,
    pub code: ErrorCode,
    pub severity: Severity,
    /// Derived from `code`.
    pub category: ErrorCategory,
    pub message: String,
    #[serde(flatten)]
    pub span: Span,
    /// Secondary locations, e.g. the place a value was consumed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl FerruleError {
    pub fn new(
        file: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            file: file.into(),
            code,
            severity: Severity::Error,
            category: code.category(),
            message: message.into(),
            span,
            related: Vec::new(),
            suggestion: None,
        }
    }

    /// Attach a secondary source location.
    pub fn with_related(mut self, span: Span) -> Self {
        self.related.push(span);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for FerruleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}] {}",
            self.span, self.code, self.category, self.message
        )
    }
}

impl std::error::Error for FerruleError {}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type => write!(f, "type"),
            Self::Scope => write!(f, "scope"),
            Self::Ownership => write!(f, "ownership"),
            Self::Structure => write!(f, "structure"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Batch of diagnostics collected across a compilation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileErrors {
    pub errors: Vec<FerruleError>,
    pub warnings: Vec<FerruleError>,
    pub total_errors: usize,
    pub total_warnings: usize,
}

impl CompileErrors {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Add an error, respecting the MAX_ERRORS limit.
    pub fn push_error(&mut self, error: FerruleError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error);
        }
        self.total_errors += 1;
    }

    pub fn push_warning(&mut self, warning: FerruleError) {
        self.warnings.push(warning);
        self.total_warnings += 1;
    }

    /// Move every diagnostic from `other` into `self`.
    pub fn extend(&mut self, other: CompileErrors) {
        // Errors `other` already dropped past its own cap still count.
        self.total_errors += other.total_errors - other.errors.len();
        for error in other.errors {
            self.push_error(error);
        }
        for warning in other.warnings {
            self.push_warning(warning);
        }
    }

    /// Serialize the batch for tools that read diagnostics as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.total_errors)?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}
