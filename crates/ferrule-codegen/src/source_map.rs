//! Source mapping: WASM function index → Ferrule source location.
//!
//! Each entry maps a function of the emitted module back to the span of its
//! declaration, which lets a host turn a trap backtrace into source
//! positions. The map is embedded as JSON in the `ferrule.sourcemap` custom
//! section when the config asks for it.

use serde::{Deserialize, Serialize};

use ferrule_types::Span;

use crate::types::COMPILER_VERSION;

/// A complete source map for a compiled module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMap {
    pub compiler_version: String,
    /// Name of the compiled source, as given in the config.
    pub source: String,
    pub entries: Vec<SourceMapEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMapEntry {
    /// Absolute WASM function index (imports first).
    pub wasm_func_index: u32,
    pub func_name: String,
    pub kind: FuncKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FuncKind {
    /// A host function declared with `import`.
    Import,
    /// An exported entry point.
    Export,
    /// A function reached only through calls.
    Internal,
}

impl Default for SourceMap {
    fn default() -> Self {
        Self::new("")
    }
}

impl SourceMap {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            compiler_version: COMPILER_VERSION.to_string(),
            source: source.into(),
            entries: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        wasm_func_index: u32,
        func_name: impl Into<String>,
        kind: FuncKind,
        span: Span,
    ) {
        self.entries.push(SourceMapEntry {
            wasm_func_index,
            func_name: func_name.into(),
            kind,
            span,
        });
    }

    pub fn find_by_func_index(&self, idx: u32) -> Option<&SourceMapEntry> {
        self.entries.iter().find(|e| e.wasm_func_index == idx)
    }

    /// Serialize to JSON bytes for the custom section.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
