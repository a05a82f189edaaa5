//! In-memory module graph and binary serialization.
//!
//! Everything that ends up with an index (functions, memories, globals) is
//! handed out as a reference wrapping a [`Latent`] cell. Instructions hold
//! clones of those references, so bodies can call functions that are not
//! yet defined, or imports that are declared later. [`Module::to_binary`]
//! assigns every index exactly once and then writes the sections in the
//! order the binary format requires, whatever order they were declared in.

use std::collections::HashMap;

use ferrule_types::Span;
use tracing::debug;

use crate::binary::{write_f32, write_f64, write_i32, write_i64, write_name, write_u32};
use crate::config::CodegenConfig;
use crate::error::{ensure_u32, CodegenError, CodegenResult};
use crate::instr::{encode_all, Instruction};
use crate::latent::Latent;
use crate::section::{vec_payload, Section};
use crate::source_map::{FuncKind, SourceMap};
use crate::types::*;

// ══════════════════════════════════════════════════════════════════════════════
// References
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FuncSlot {
    Import,
    Defined(usize),
}

/// A function of the module, imported or defined.
#[derive(Debug, Clone)]
pub struct FuncRef {
    slot: FuncSlot,
    index: Latent<u32>,
}

impl FuncRef {
    pub fn index(&self) -> &Latent<u32> {
        &self.index
    }
}

#[derive(Debug, Clone)]
pub struct GlobalRef {
    id: usize,
    index: Latent<u32>,
}

impl GlobalRef {
    pub fn index(&self) -> &Latent<u32> {
        &self.index
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRef {
    id: usize,
    index: Latent<u32>,
}

impl MemoryRef {
    pub fn index(&self) -> &Latent<u32> {
        &self.index
    }
}

#[derive(Debug, Clone)]
pub enum ExportTarget {
    Func(FuncRef),
    Global(GlobalRef),
    Memory(MemoryRef),
}

/// Constant initializer of a global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl GlobalInit {
    pub fn ty(self) -> ValType {
        match self {
            GlobalInit::I32(_) => ValType::I32,
            GlobalInit::I64(_) => ValType::I64,
            GlobalInit::F32(_) => ValType::F32,
            GlobalInit::F64(_) => ValType::F64,
        }
    }
}

/// A finished function body.
#[derive(Debug, Clone, Default)]
pub struct FunctionBody {
    /// Run-length locals table, `(count, type)`.
    pub locals: Vec<(u32, ValType)>,
    pub code: Vec<Instruction>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Module
// ══════════════════════════════════════════════════════════════════════════════

struct ImportEntry {
    module: String,
    name: String,
    type_index: u32,
    func: FuncRef,
}

struct FunctionEntry {
    name: String,
    type_index: u32,
    func: FuncRef,
    body: Option<FunctionBody>,
}

struct MemoryEntry {
    min: u32,
    max: Option<u32>,
    memory: MemoryRef,
}

struct GlobalEntry {
    mutable: bool,
    init: GlobalInit,
    global: GlobalRef,
}

struct ExportEntry {
    name: String,
    target: ExportTarget,
}

struct DataSegment {
    offset: u32,
    bytes: Vec<u8>,
}

struct MappedFunction {
    func: FuncRef,
    name: String,
    kind: FuncKind,
    span: Span,
}

pub struct Module {
    validate: bool,
    embed_source_map: bool,
    types: Vec<FuncType>,
    /// Encoded signature → type index.
    type_index: HashMap<Vec<u8>, u32>,
    imports: Vec<ImportEntry>,
    functions: Vec<FunctionEntry>,
    memories: Vec<MemoryEntry>,
    globals: Vec<GlobalEntry>,
    exports: Vec<ExportEntry>,
    start: Option<FuncRef>,
    data: Vec<DataSegment>,
    source_map: Option<SourceMap>,
    mapped: Vec<MappedFunction>,
}

impl Module {
    pub fn new(config: &CodegenConfig) -> Self {
        Self {
            validate: config.validate,
            embed_source_map: config.source_map,
            types: Vec::new(),
            type_index: HashMap::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exports: Vec::new(),
            start: None,
            data: Vec::new(),
            source_map: None,
            mapped: Vec::new(),
        }
    }

    // ── Declarations ─────────────────────────────────────────────────────

    /// Index of `ty` in the type table, adding it if no identical signature
    /// is present.
    pub fn register_type(&mut self, ty: FuncType) -> CodegenResult<u32> {
        let encoded = ty.encode()?;
        if let Some(&index) = self.type_index.get(&encoded) {
            return Ok(index);
        }
        let index = ensure_u32(self.types.len(), "type count")?;
        self.types.push(ty);
        self.type_index.insert(encoded, index);
        Ok(index)
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn import_function(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
    ) -> CodegenResult<FuncRef> {
        let type_index = self.register_type(ty)?;
        let func = FuncRef {
            slot: FuncSlot::Import,
            index: Latent::new("function index"),
        };
        self.imports.push(ImportEntry {
            module: module.to_string(),
            name: name.to_string(),
            type_index,
            func: func.clone(),
        });
        Ok(func)
    }

    /// Declare a function whose body is supplied later with
    /// [`Module::define_function`].
    pub fn create_function(&mut self, name: &str, ty: FuncType) -> CodegenResult<FuncRef> {
        let type_index = self.register_type(ty)?;
        let func = FuncRef {
            slot: FuncSlot::Defined(self.functions.len()),
            index: Latent::new("function index"),
        };
        self.functions.push(FunctionEntry {
            name: name.to_string(),
            type_index,
            func: func.clone(),
            body: None,
        });
        Ok(func)
    }

    pub fn define_function(&mut self, func: &FuncRef, body: FunctionBody) -> CodegenResult<()> {
        let FuncSlot::Defined(id) = func.slot else {
            return Err(CodegenError::Internal(
                "an imported function cannot be given a body".into(),
            ));
        };
        let entry = self
            .functions
            .get_mut(id)
            .ok_or_else(|| CodegenError::Internal(format!("unknown function slot {id}")))?;
        if entry.body.is_some() {
            return Err(CodegenError::Internal(format!(
                "function `{}` defined twice",
                entry.name
            )));
        }
        entry.body = Some(body);
        Ok(())
    }

    pub fn add_memory(&mut self, min: u32, max: Option<u32>) -> CodegenResult<MemoryRef> {
        if !self.memories.is_empty() {
            return Err(CodegenError::Internal(
                "a module has at most one linear memory".into(),
            ));
        }
        if max.is_some_and(|max| max < min) {
            return Err(CodegenError::Internal(format!(
                "memory maximum {max:?} is below its minimum {min}"
            )));
        }
        let memory = MemoryRef {
            id: self.memories.len(),
            index: Latent::new("memory index"),
        };
        self.memories.push(MemoryEntry {
            min,
            max,
            memory: memory.clone(),
        });
        Ok(memory)
    }

    pub fn add_global(
        &mut self,
        ty: ValType,
        mutable: bool,
        init: GlobalInit,
    ) -> CodegenResult<GlobalRef> {
        if init.ty() != ty {
            return Err(CodegenError::Internal(format!(
                "global of type {} initialized with a {} constant",
                ty.name(),
                init.ty().name()
            )));
        }
        let global = GlobalRef {
            id: self.globals.len(),
            index: Latent::new("global index"),
        };
        self.globals.push(GlobalEntry {
            mutable,
            init,
            global: global.clone(),
        });
        Ok(global)
    }

    pub fn export(&mut self, name: &str, target: ExportTarget) -> CodegenResult<()> {
        if self.exports.iter().any(|e| e.name == name) {
            return Err(CodegenError::Internal(format!(
                "export `{name}` declared twice"
            )));
        }
        self.exports.push(ExportEntry {
            name: name.to_string(),
            target,
        });
        Ok(())
    }

    pub fn set_start(&mut self, func: &FuncRef) {
        self.start = Some(func.clone());
    }

    /// Initialize memory at `offset` with `bytes` when the module is
    /// instantiated.
    pub fn set_data(&mut self, offset: u32, bytes: Vec<u8>) {
        self.data.push(DataSegment { offset, bytes });
    }

    /// Collect a source map; functions are added with
    /// [`Module::map_function`]. It is embedded as a custom section when the
    /// config enables `source_map`.
    pub fn attach_source_map(&mut self, map: SourceMap) {
        self.source_map = Some(map);
    }

    pub fn map_function(&mut self, func: &FuncRef, name: &str, kind: FuncKind, span: Span) {
        self.mapped.push(MappedFunction {
            func: func.clone(),
            name: name.to_string(),
            kind,
            span,
        });
    }

    // ── Serialization ────────────────────────────────────────────────────

    pub fn to_binary(self) -> CodegenResult<Vec<u8>> {
        self.to_binary_with_source_map().map(|(bytes, _)| bytes)
    }

    /// Serialize, also returning the collected source map.
    pub fn to_binary_with_source_map(mut self) -> CodegenResult<(Vec<u8>, Option<SourceMap>)> {
        self.linearize()?;

        if let Some(map) = self.source_map.as_mut() {
            for mapped in self.mapped.drain(..) {
                map.push(mapped.func.index().get()?, mapped.name, mapped.kind, mapped.span);
            }
            map.entries.sort_by_key(|e| e.wasm_func_index);
        }

        let mut sections = Vec::new();
        sections.extend(self.type_section()?);
        sections.extend(self.import_section()?);
        sections.extend(self.function_section()?);
        sections.extend(self.memory_section()?);
        sections.extend(self.global_section()?);
        sections.extend(self.export_section()?);
        sections.extend(self.start_section()?);
        sections.extend(self.code_section()?);
        sections.extend(self.data_section()?);
        if let Some(map) = self.source_map.as_ref().filter(|_| self.embed_source_map) {
            sections.push(Section::custom(SOURCE_MAP_SECTION_NAME, &map.to_json())?);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&WASM_MAGIC);
        out.extend_from_slice(&WASM_VERSION);
        for section in &sections {
            section.encode_into(&mut out)?;
        }
        debug!(
            bytes = out.len(),
            types = self.types.len(),
            imports = self.imports.len(),
            functions = self.functions.len(),
            "module serialized"
        );

        if self.validate {
            wasmparser::validate(&out)
                .map_err(|e| CodegenError::ValidationFailed(format!("{e}")))?;
        }
        Ok((out, self.source_map))
    }

    /// Assign final indices. Imports precede defined functions.
    fn linearize(&self) -> CodegenResult<()> {
        let mut next = 0u32;
        let funcs = self
            .imports
            .iter()
            .map(|i| &i.func)
            .chain(self.functions.iter().map(|f| &f.func));
        for func in funcs {
            func.index.resolve(next)?;
            next = next
                .checked_add(1)
                .ok_or_else(|| CodegenError::LimitExceeded("function count".into()))?;
        }
        for memory in &self.memories {
            memory
                .memory
                .index
                .resolve(ensure_u32(memory.memory.id, "memory index")?)?;
        }
        for global in &self.globals {
            global
                .global
                .index
                .resolve(ensure_u32(global.global.id, "global index")?)?;
        }
        Ok(())
    }

    fn type_section(&self) -> CodegenResult<Option<Section>> {
        if self.types.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.types.len(), "type count")?;
        for ty in &self.types {
            payload.extend(ty.encode()?);
        }
        Ok(Some(Section::new(SECTION_TYPE, payload)))
    }

    fn import_section(&self) -> CodegenResult<Option<Section>> {
        if self.imports.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.imports.len(), "import count")?;
        for import in &self.imports {
            write_name(&mut payload, &import.module)?;
            write_name(&mut payload, &import.name)?;
            payload.push(EXTERNAL_FUNC);
            write_u32(&mut payload, import.type_index);
        }
        Ok(Some(Section::new(SECTION_IMPORT, payload)))
    }

    fn function_section(&self) -> CodegenResult<Option<Section>> {
        if self.functions.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.functions.len(), "function count")?;
        for function in &self.functions {
            write_u32(&mut payload, function.type_index);
        }
        Ok(Some(Section::new(SECTION_FUNCTION, payload)))
    }

    fn memory_section(&self) -> CodegenResult<Option<Section>> {
        if self.memories.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.memories.len(), "memory count")?;
        for memory in &self.memories {
            match memory.max {
                Some(max) => {
                    payload.push(0x01);
                    write_u32(&mut payload, memory.min);
                    write_u32(&mut payload, max);
                }
                None => {
                    payload.push(0x00);
                    write_u32(&mut payload, memory.min);
                }
            }
        }
        Ok(Some(Section::new(SECTION_MEMORY, payload)))
    }

    fn global_section(&self) -> CodegenResult<Option<Section>> {
        if self.globals.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.globals.len(), "global count")?;
        for global in &self.globals {
            payload.push(global.init.ty().to_byte());
            payload.push(u8::from(global.mutable));
            match global.init {
                GlobalInit::I32(v) => {
                    payload.push(0x41);
                    write_i32(&mut payload, v);
                }
                GlobalInit::I64(v) => {
                    payload.push(0x42);
                    write_i64(&mut payload, v);
                }
                GlobalInit::F32(v) => {
                    payload.push(0x43);
                    write_f32(&mut payload, v);
                }
                GlobalInit::F64(v) => {
                    payload.push(0x44);
                    write_f64(&mut payload, v);
                }
            }
            payload.push(0x0B);
        }
        Ok(Some(Section::new(SECTION_GLOBAL, payload)))
    }

    fn export_section(&self) -> CodegenResult<Option<Section>> {
        if self.exports.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.exports.len(), "export count")?;
        for export in &self.exports {
            write_name(&mut payload, &export.name)?;
            let (kind, index) = match &export.target {
                ExportTarget::Func(func) => (EXTERNAL_FUNC, func.index.get()?),
                ExportTarget::Global(global) => (EXTERNAL_GLOBAL, global.index.get()?),
                ExportTarget::Memory(memory) => (EXTERNAL_MEMORY, memory.index.get()?),
            };
            payload.push(kind);
            write_u32(&mut payload, index);
        }
        Ok(Some(Section::new(SECTION_EXPORT, payload)))
    }

    fn start_section(&self) -> CodegenResult<Option<Section>> {
        let Some(start) = &self.start else {
            return Ok(None);
        };
        let mut payload = Vec::new();
        write_u32(&mut payload, start.index.get()?);
        Ok(Some(Section::new(SECTION_START, payload)))
    }

    fn code_section(&self) -> CodegenResult<Option<Section>> {
        if self.functions.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.functions.len(), "function count")?;
        for function in &self.functions {
            let body = function.body.as_ref().ok_or_else(|| {
                CodegenError::Internal(format!(
                    "function `{}` was declared but never defined",
                    function.name
                ))
            })?;
            let mut encoded = vec_payload(body.locals.len(), "local group count")?;
            for (count, ty) in &body.locals {
                write_u32(&mut encoded, *count);
                encoded.push(ty.to_byte());
            }
            encode_all(&body.code, &mut encoded)?;
            encoded.push(0x0B);

            write_u32(&mut payload, ensure_u32(encoded.len(), "function body size")?);
            payload.extend_from_slice(&encoded);
        }
        Ok(Some(Section::new(SECTION_CODE, payload)))
    }

    fn data_section(&self) -> CodegenResult<Option<Section>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut payload = vec_payload(self.data.len(), "data segment count")?;
        for segment in &self.data {
            // Active segment for memory 0.
            payload.push(0x00);
            payload.push(0x41);
            // Addresses are u32; the init expression reads the bits as i32.
            write_i32(&mut payload, i32::from_ne_bytes(segment.offset.to_ne_bytes()));
            payload.push(0x0B);
            crate::binary::write_bytes(&mut payload, &segment.bytes)?;
        }
        Ok(Some(Section::new(SECTION_DATA, payload)))
    }

    /// Names of functions that were declared but not yet given a body.
    pub fn undefined_functions(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.body.is_none())
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Whether an export named `name` exists.
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e.name == name)
    }

    #[cfg(test)]
    fn export_names(&self) -> std::collections::HashSet<&str> {
        self.exports.iter().map(|e| e.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::read_unsigned;
    use crate::instr::NumericOp;

    fn module() -> Module {
        Module::new(&CodegenConfig::default())
    }

    fn section_ids(bytes: &[u8]) -> Vec<u8> {
        assert_eq!(&bytes[..4], b"\0asm");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        let mut ids = Vec::new();
        let mut pos = 8;
        while pos < bytes.len() {
            ids.push(bytes[pos]);
            pos += 1;
            let len = read_unsigned(bytes, &mut pos).unwrap() as usize;
            pos += len;
        }
        ids
    }

    fn returning(value: i32) -> FunctionBody {
        FunctionBody {
            locals: vec![],
            code: vec![Instruction::I32Const(value)],
        }
    }

    #[test]
    fn identical_signatures_share_an_index() {
        let mut m = module();
        let a = m
            .register_type(FuncType::new([ValType::I32, ValType::I64], [ValType::F64]))
            .unwrap();
        let b = m
            .register_type(FuncType::new([ValType::I32, ValType::I64], [ValType::F64]))
            .unwrap();
        let c = m
            .register_type(FuncType::new([ValType::I64, ValType::I32], [ValType::F64]))
            .unwrap();
        let d = m.register_type(FuncType::new([], [])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(c, d);
        assert_eq!(m.type_count(), 3);
    }

    #[test]
    fn high_data_offsets_keep_their_bits() {
        use crate::binary::read_signed;

        let mut m = module();
        m.set_data(0x8000_0000, b"x".to_vec());
        let section = m.data_section().unwrap().unwrap();
        let payload = section.payload_bytes();
        assert_eq!(&payload[..3], &[1, 0x00, 0x41]);
        let mut pos = 3;
        let offset = read_signed(payload, &mut pos).unwrap();
        assert_eq!(offset, i64::from(i32::MIN));
        assert_eq!(offset as i32 as u32, 0x8000_0000);
        assert_eq!(&payload[pos..], &[0x0B, 1, b'x']);
    }

    #[test]
    fn empty_module_is_just_the_header() {
        let bytes = module().to_binary().unwrap();
        assert_eq!(bytes, b"\0asm\x01\x00\x00\x00".to_vec());
    }

    #[test]
    fn sections_follow_binary_order_not_declaration_order() {
        let mut m = module();
        let memory = m.add_memory(1, Some(2)).unwrap();
        m.export("memory", ExportTarget::Memory(memory)).unwrap();
        m.set_data(16, b"hi".to_vec());
        let global = m
            .add_global(ValType::I32, true, GlobalInit::I32(1024))
            .unwrap();
        m.export("sp", ExportTarget::Global(global)).unwrap();
        let main = m
            .create_function("main", FuncType::new([], [ValType::I32]))
            .unwrap();
        m.define_function(&main, returning(7)).unwrap();
        m.export("main", ExportTarget::Func(main)).unwrap();
        let log = m
            .import_function("env", "log", FuncType::new([ValType::I32], []))
            .unwrap();
        let init = m.create_function("init", FuncType::default()).unwrap();
        m.define_function(
            &init,
            FunctionBody {
                locals: vec![],
                code: vec![Instruction::I32Const(1), Instruction::Call(log)],
            },
        )
        .unwrap();
        m.set_start(&init);
        assert_eq!(m.export_names().len(), 3);

        let bytes = m.to_binary().unwrap();
        assert_eq!(
            section_ids(&bytes),
            vec![
                SECTION_TYPE,
                SECTION_IMPORT,
                SECTION_FUNCTION,
                SECTION_MEMORY,
                SECTION_GLOBAL,
                SECTION_EXPORT,
                SECTION_START,
                SECTION_CODE,
                SECTION_DATA,
            ]
        );
    }

    #[test]
    fn imports_take_the_first_function_indices() {
        let mut m = module();
        let local = m
            .create_function("local", FuncType::new([], [ValType::I32]))
            .unwrap();
        let caller = m
            .create_function("caller", FuncType::new([], [ValType::I32]))
            .unwrap();
        let host = m
            .import_function("env", "now", FuncType::new([], [ValType::I32]))
            .unwrap();
        m.define_function(&local, returning(1)).unwrap();
        m.define_function(
            &caller,
            FunctionBody {
                locals: vec![],
                code: vec![
                    Instruction::Call(local.clone()),
                    Instruction::Call(host.clone()),
                    Instruction::Numeric(NumericOp::I32Add),
                ],
            },
        )
        .unwrap();
        assert!(!local.index().is_resolved());
        m.to_binary().unwrap();
        assert_eq!(host.index().get(), Ok(0));
        assert_eq!(local.index().get(), Ok(1));
        assert_eq!(caller.index().get(), Ok(2));
    }

    #[test]
    fn locals_table_is_run_length_encoded() {
        let mut m = Module::new(&CodegenConfig {
            validate: true,
            ..CodegenConfig::default()
        });
        let f = m.create_function("f", FuncType::default()).unwrap();
        m.define_function(
            &f,
            FunctionBody {
                locals: vec![(3, ValType::I32), (2, ValType::F64)],
                code: vec![],
            },
        )
        .unwrap();
        let bytes = m.to_binary().unwrap();
        // body: size, 2 groups, (3 x i32), (2 x f64), end
        let body = [0x06, 0x02, 0x03, 0x7F, 0x02, 0x7C, 0x0B];
        assert!(bytes.windows(body.len()).any(|w| w == body));
    }

    #[test]
    fn undefined_function_is_an_internal_error() {
        let mut m = module();
        m.create_function("ghost", FuncType::default()).unwrap();
        assert_eq!(m.undefined_functions(), vec!["ghost"]);
        assert!(matches!(m.to_binary(), Err(CodegenError::Internal(_))));
    }

    #[test]
    fn invalid_bodies_fail_validation() {
        let mut m = module();
        let f = m
            .create_function("f", FuncType::new([], [ValType::I64]))
            .unwrap();
        m.define_function(&f, returning(1)).unwrap();
        assert!(matches!(
            m.to_binary(),
            Err(CodegenError::ValidationFailed(_))
        ));
    }

    #[test]
    fn source_map_section_lists_functions_by_index() {
        let mut m = module();
        m.attach_source_map(SourceMap::new("t.fe"));
        let f = m
            .create_function("f", FuncType::new([], [ValType::I32]))
            .unwrap();
        m.define_function(&f, returning(3)).unwrap();
        m.map_function(&f, "f", FuncKind::Export, Span::new(1, 1, 3, 2));
        let (bytes, map) = m.to_binary_with_source_map().unwrap();
        let map = map.unwrap();
        assert_eq!(map.entries[0].wasm_func_index, 0);
        assert_eq!(*section_ids(&bytes).last().unwrap(), SECTION_CUSTOM);
    }

    #[test]
    fn global_initializer_must_match_type() {
        let mut m = module();
        assert!(m.add_global(ValType::I64, false, GlobalInit::I32(0)).is_err());
        assert!(m.add_memory(2, Some(1)).is_err());
        m.add_memory(1, None).unwrap();
        assert!(m.add_memory(1, None).is_err());
    }
}
