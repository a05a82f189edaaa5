//! Code generator configuration.

use serde::{Deserialize, Serialize};

use crate::types::PAGE_SIZE;

/// What `free` does with an allocation that owns no bytes of its own
/// (zero-sized, or aliased onto another allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreePolicy {
    /// Silently ignore the free.
    #[default]
    Lenient,
    /// Report it as an allocator fault.
    Strict,
}

/// Options controlling module layout and checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// File name reported in diagnostics and the source map.
    pub source_name: String,
    pub free_policy: FreePolicy,
    /// Frame sizes are rounded up to this many bytes.
    pub stack_alignment: u32,
    /// Bytes reserved at the top of the initial memory for the shadow stack.
    pub stack_size: u32,
    /// Initial linear memory size in pages.
    pub memory_pages: u32,
    pub max_memory_pages: Option<u32>,
    /// Run `wasmparser` validation over the finished module.
    pub validate: bool,
    /// Embed the JSON source map as a custom section.
    pub source_map: bool,
    pub export_memory: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            source_name: "main.fe".to_string(),
            free_policy: FreePolicy::Lenient,
            stack_alignment: 16,
            stack_size: PAGE_SIZE,
            memory_pages: 2,
            max_memory_pages: Some(256),
            validate: true,
            source_map: true,
            export_memory: true,
        }
    }
}

impl CodegenConfig {
    /// Default settings with [`FreePolicy::Strict`].
    pub fn strict() -> Self {
        Self {
            free_policy: FreePolicy::Strict,
            ..Self::default()
        }
    }

    /// Initial value of the stack pointer: the top of the reserved region.
    pub fn stack_top(&self) -> u32 {
        self.stack_size
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
