//! Ferrule WASM code generator: compiles a Ferrule AST to a `.wasm` binary.
//!
//! # Architecture
//!
//! The backend is built from small layers, lowest first:
//!
//! - [`binary`]: LEB128 and IEEE-754 primitives.
//! - [`latent`]: single-assignment cells for indices and offsets that are
//!   only known once the module or frame is laid out.
//! - [`instr`] / [`section`] / [`module`]: an instruction tree and a module
//!   builder that assigns every index at serialization time.
//! - [`register`]: per-function local slots, reused by value type.
//! - [`stack`]: a deferred stack-frame allocator. Offsets resolve after the
//!   whole function body is known, with branch scopes and aliasing.
//! - [`linear`]: ownership tracking for structure values, field by field.
//! - [`compiler`]: the glue that walks the AST.
//!
//! ## Module shape
//!
//! - `memory`: linear memory (exported when configured)
//! - `__stack_pointer`: mutable `i32` global, the top of the shadow stack
//! - one import per `import` declaration
//! - one export per `export fn`, plus every function it reaches
//! - `ferrule.sourcemap`: custom section mapping functions to source spans
//!
//! ## Value representation
//!
//! Primitives (`i32`, `i64`, `f32`, `f64`, `bool` as `i32`) live in WASM
//! locals. Structures live in the caller's stack frame and travel as `i32`
//! addresses; a structure result is written through a hidden out-pointer.

pub mod binary;
pub mod compiler;
pub mod config;
mod context;
pub mod error;
mod expr;
pub mod instr;
pub mod latent;
pub mod layout;
pub mod linear;
pub mod module;
pub mod register;
pub mod section;
pub mod source_map;
pub mod stack;
mod stmt;
pub mod types;

pub use compiler::{compile, compile_with_source_map};
pub use config::{CodegenConfig, FreePolicy};
pub use error::{CodegenError, CodegenResult};
pub use source_map::SourceMap;
