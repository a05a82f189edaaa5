//! WASM value types, signatures and binary-format constants.

use crate::binary::write_u32;
use crate::error::{ensure_u32, CodegenResult};

/// A WASM number type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub fn to_byte(self) -> u8 {
        match self {
            ValType::I32 => 0x7F,
            ValType::I64 => 0x7E,
            ValType::F32 => 0x7D,
            ValType::F64 => 0x7C,
        }
    }

    /// Byte width of the type when stored in linear memory.
    pub fn size(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Canonical type-section encoding: `0x60 vec(params) vec(results)`.
    pub fn encode(&self) -> CodegenResult<Vec<u8>> {
        let mut out = vec![0x60];
        write_u32(&mut out, ensure_u32(self.params.len(), "parameter count")?);
        out.extend(self.params.iter().map(|t| t.to_byte()));
        write_u32(&mut out, ensure_u32(self.results.len(), "result count")?);
        out.extend(self.results.iter().map(|t| t.to_byte()));
        Ok(out)
    }
}

/// Block signature for structured control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
}

impl BlockType {
    pub fn to_byte(self) -> u8 {
        match self {
            BlockType::Empty => 0x40,
            BlockType::Value(ty) => ty.to_byte(),
        }
    }
}

// ── Module header ────────────────────────────────────────────────────────────

pub const WASM_MAGIC: [u8; 4] = *b"\0asm";
pub const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

// ── Section ids, in the order they must appear ───────────────────────────────

pub const SECTION_CUSTOM: u8 = 0;
pub const SECTION_TYPE: u8 = 1;
pub const SECTION_IMPORT: u8 = 2;
pub const SECTION_FUNCTION: u8 = 3;
pub const SECTION_TABLE: u8 = 4;
pub const SECTION_MEMORY: u8 = 5;
pub const SECTION_GLOBAL: u8 = 6;
pub const SECTION_EXPORT: u8 = 7;
pub const SECTION_START: u8 = 8;
pub const SECTION_ELEMENT: u8 = 9;
pub const SECTION_CODE: u8 = 10;
pub const SECTION_DATA: u8 = 11;

// ── External kinds (import/export descriptors) ───────────────────────────────

pub const EXTERNAL_FUNC: u8 = 0x00;
pub const EXTERNAL_MEMORY: u8 = 0x02;
pub const EXTERNAL_GLOBAL: u8 = 0x03;

// ── Memory ───────────────────────────────────────────────────────────────────

/// Linear memory page size (64 KiB).
pub const PAGE_SIZE: u32 = 65_536;

/// Name of the exported shadow-stack pointer global.
pub const STACK_POINTER_NAME: &str = "__stack_pointer";

// ── Custom section ───────────────────────────────────────────────────────────

/// Custom section holding the JSON source map.
pub const SOURCE_MAP_SECTION_NAME: &str = "ferrule.sourcemap";
/// Compiler version embedded in the source map.
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");
