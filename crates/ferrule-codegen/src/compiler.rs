//! Module assembler.
//!
//! Orchestrates the code generation pipeline:
//! 1. Lay out every structure declaration
//! 2. Declare linear memory and the `__stack_pointer` global
//! 3. Declare imports and function signatures
//! 4. Compile each exported function, and every callee it reaches on demand
//! 5. Serialize the module and validate it with `wasmparser`

use std::collections::HashMap;
use std::rc::Rc;

use ferrule_types::ast::*;
use ferrule_types::{CompileErrors, ErrorCode, FerruleError, Span};
use tracing::{debug, instrument, warn};

use crate::config::CodegenConfig;
use crate::context::FuncContext;
use crate::error::{CodegenError, CodegenResult};
use crate::instr::Instruction;
use crate::layout::{Layouts, Ty};
use crate::module::{ExportTarget, FuncRef, FunctionBody, GlobalInit, GlobalRef, Module};
use crate::source_map::{FuncKind, SourceMap};
use crate::stmt;
use crate::types::{FuncType, ValType, PAGE_SIZE, STACK_POINTER_NAME};

// ══════════════════════════════════════════════════════════════════════════════
// Public API
// ══════════════════════════════════════════════════════════════════════════════

/// Compile a Ferrule [`Program`] into a `.wasm` binary.
///
/// Mistakes in the program are reported together as
/// [`CodegenError::Diagnostics`]; any other error is a backend fault.
pub fn compile(program: &Program, config: &CodegenConfig) -> CodegenResult<Vec<u8>> {
    compile_with_source_map(program, config).map(|(bytes, _)| bytes)
}

/// Like [`compile`], also returning the function-level source map.
pub fn compile_with_source_map(
    program: &Program,
    config: &CodegenConfig,
) -> CodegenResult<(Vec<u8>, SourceMap)> {
    Compiler::new(program, config)?.run()
}

// ══════════════════════════════════════════════════════════════════════════════
// Compiler
// ══════════════════════════════════════════════════════════════════════════════

/// Parameter and result types of a callable function.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
}

impl Signature {
    /// The WASM signature. Structures travel as `i32` pointers; a structure
    /// result becomes a hidden leading out-pointer.
    pub fn wasm_type(&self) -> FuncType {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        let mut results = Vec::new();
        match &self.ret {
            Some(ty) if ty.is_struct() => params.push(ValType::I32),
            Some(ty) => results.push(ty.val_type()),
            None => {}
        }
        params.extend(self.params.iter().map(Ty::val_type));
        FuncType::new(params, results)
    }

    fn has_struct(&self) -> bool {
        self.params.iter().chain(&self.ret).any(Ty::is_struct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompileState {
    NotStarted,
    InProgress,
    Done,
}

struct FunctionEntry<'p> {
    /// `None` for imports.
    decl: Option<&'p FunctionDecl>,
    /// `None` when the declared signature has errors.
    signature: Option<Rc<Signature>>,
    func: Option<FuncRef>,
    state: CompileState,
}

/// Module-wide compilation state.
pub struct Compiler<'p> {
    program: &'p Program,
    config: &'p CodegenConfig,
    pub(crate) module: Module,
    pub(crate) layouts: Rc<Layouts>,
    pub(crate) stack_pointer: GlobalRef,
    functions: HashMap<&'p str, FunctionEntry<'p>>,
    errors: CompileErrors,
}

impl<'p> Compiler<'p> {
    fn new(program: &'p Program, config: &'p CodegenConfig) -> CodegenResult<Self> {
        let layouts = Layouts::build(&program.structs, &config.source_name).map_err(|errors| {
            let mut batch = CompileErrors::empty();
            for error in errors {
                batch.push_error(error);
            }
            CodegenError::Diagnostics(batch)
        })?;

        let memory_bytes = u64::from(config.memory_pages) * u64::from(PAGE_SIZE);
        if u64::from(config.stack_top()) > memory_bytes {
            return Err(CodegenError::LimitExceeded(format!(
                "stack of {} bytes does not fit in {} memory pages",
                config.stack_size, config.memory_pages
            )));
        }
        let stack_top = i32::try_from(config.stack_top())
            .map_err(|_| CodegenError::LimitExceeded("stack size".into()))?;

        let mut module = Module::new(config);
        let memory = module.add_memory(config.memory_pages, config.max_memory_pages)?;
        if config.export_memory {
            module.export("memory", ExportTarget::Memory(memory))?;
        }
        let stack_pointer = module.add_global(ValType::I32, true, GlobalInit::I32(stack_top))?;
        module.export(STACK_POINTER_NAME, ExportTarget::Global(stack_pointer.clone()))?;
        module.attach_source_map(SourceMap::new(&config.source_name));

        Ok(Self {
            program,
            config,
            module,
            layouts: Rc::new(layouts),
            stack_pointer,
            functions: HashMap::new(),
            errors: CompileErrors::empty(),
        })
    }

    pub fn config(&self) -> &CodegenConfig {
        self.config
    }

    /// Source name used in diagnostics.
    pub fn file(&self) -> &str {
        &self.config.source_name
    }

    pub fn signature(&self, name: &str) -> Option<Rc<Signature>> {
        self.functions.get(name).and_then(|f| f.signature.clone())
    }

    /// Run the full compilation pipeline.
    fn run(mut self) -> CodegenResult<(Vec<u8>, SourceMap)> {
        self.declare_imports()?;
        self.declare_functions();

        let program = self.program;
        for decl in program.functions.iter().filter(|f| f.exported) {
            let name = decl.name.name.as_str();
            if self.module.has_export(name) {
                self.push_error(
                    ErrorCode::DUPLICATE_DECLARATION,
                    format!("export `{name}` collides with a reserved export"),
                    decl.name.span,
                );
                continue;
            }
            match self.ensure_compiled(name) {
                Ok(Some((func, _))) => self.module.export(name, ExportTarget::Func(func))?,
                Ok(None) => {}
                Err(e) if e.is_user_facing() => self.report(e),
                Err(e) => return Err(e),
            }
        }

        if self.errors.has_errors() {
            warn!(errors = self.errors.total_errors, "compilation failed");
            return Err(CodegenError::Diagnostics(self.errors));
        }

        let source = self.config.source_name.clone();
        let (bytes, map) = self.module.to_binary_with_source_map()?;
        Ok((bytes, map.unwrap_or_else(|| SourceMap::new(source))))
    }

    // ── Declarations ─────────────────────────────────────────────────────

    fn declare_imports(&mut self) -> CodegenResult<()> {
        let program = self.program;
        for import in &program.imports {
            let name = import.binding.name.as_str();
            if self.functions.contains_key(name) {
                self.push_error(
                    ErrorCode::DUPLICATE_DECLARATION,
                    format!("function `{name}` is declared more than once"),
                    import.binding.span,
                );
                continue;
            }
            let Some(signature) = self.resolve_signature(&import.params, import.ret.as_ref()) else {
                continue;
            };
            if signature.has_struct() {
                self.push_error(
                    ErrorCode::UNSUPPORTED,
                    format!("imported function `{name}` may only take and return primitives"),
                    import.span,
                );
                continue;
            }
            let func = self
                .module
                .import_function(&import.module, &import.field, signature.wasm_type())?;
            self.module.map_function(&func, name, FuncKind::Import, import.span);
            debug!(module = %import.module, field = %import.field, "import declared");
            self.functions.insert(
                name,
                FunctionEntry {
                    decl: None,
                    signature: Some(Rc::new(signature)),
                    func: Some(func),
                    state: CompileState::Done,
                },
            );
        }
        Ok(())
    }

    fn declare_functions(&mut self) {
        let program = self.program;
        for decl in &program.functions {
            let name = decl.name.name.as_str();
            if self.functions.contains_key(name) {
                self.push_error(
                    ErrorCode::DUPLICATE_DECLARATION,
                    format!("function `{name}` is declared more than once"),
                    decl.name.span,
                );
                continue;
            }

            let mut seen: Vec<&str> = Vec::with_capacity(decl.params.len());
            let mut duplicate_params = false;
            for param in &decl.params {
                if seen.contains(&param.name.name.as_str()) {
                    duplicate_params = true;
                    self.push_error(
                        ErrorCode::DUPLICATE_DECLARATION,
                        format!("parameter `{}` is declared more than once", param.name.name),
                        param.name.span,
                    );
                }
                seen.push(&param.name.name);
            }

            let params: Vec<TypeAnnotation> =
                decl.params.iter().map(|p| p.type_ann.clone()).collect();
            let mut signature = self.resolve_signature(&params, decl.ret.as_ref());
            if decl.exported && signature.as_ref().is_some_and(Signature::has_struct) {
                self.push_error(
                    ErrorCode::UNSUPPORTED,
                    format!("exported function `{name}` may only take and return primitives"),
                    decl.span,
                );
                signature = None;
            }
            if duplicate_params {
                signature = None;
            }

            self.functions.insert(
                name,
                FunctionEntry {
                    decl: Some(decl),
                    signature: signature.map(Rc::new),
                    func: None,
                    state: CompileState::NotStarted,
                },
            );
        }
    }

    fn resolve_signature(
        &mut self,
        params: &[TypeAnnotation],
        ret: Option<&TypeAnnotation>,
    ) -> Option<Signature> {
        let mut ok = true;
        let mut resolved = Vec::with_capacity(params.len());
        for ann in params {
            match self.layouts.resolve(ann, &self.config.source_name) {
                Ok(ty) => resolved.push(ty),
                Err(e) => {
                    self.errors.push_error(e);
                    ok = false;
                }
            }
        }
        let ret = match ret.map(|ann| self.layouts.resolve(ann, &self.config.source_name)) {
            Some(Ok(ty)) => Some(ty),
            Some(Err(e)) => {
                self.errors.push_error(e);
                ok = false;
                None
            }
            None => None,
        };
        ok.then_some(Signature {
            params: resolved,
            ret,
        })
    }

    // ── Function compilation ─────────────────────────────────────────────

    /// The function called `name`, compiling it first if nothing has
    /// requested it yet. A recursive request sees the in-progress function.
    ///
    /// Returns `Ok(None)` for an unknown name. A function whose signature
    /// failed to resolve yields an empty [`CodegenError::Semantic`]: its
    /// diagnostics are already recorded.
    pub fn ensure_compiled(&mut self, name: &str) -> CodegenResult<Option<(FuncRef, Rc<Signature>)>> {
        let Some(entry) = self.functions.get(name) else {
            return Ok(None);
        };
        let Some(signature) = entry.signature.clone() else {
            return Err(CodegenError::Semantic(Vec::new()));
        };
        let (state, existing, decl) = (entry.state, entry.func.clone(), entry.decl);
        match (state, existing, decl) {
            (CompileState::InProgress | CompileState::Done, Some(func), _) => {
                Ok(Some((func, signature)))
            }
            (CompileState::NotStarted, _, Some(decl)) => {
                let func = self.module.create_function(name, signature.wasm_type())?;
                if let Some(entry) = self.functions.get_mut(name) {
                    entry.func = Some(func.clone());
                    entry.state = CompileState::InProgress;
                }
                let kind = if decl.exported {
                    FuncKind::Export
                } else {
                    FuncKind::Internal
                };
                self.module.map_function(&func, name, kind, decl.span);

                let body = match self.compile_function(decl, &signature) {
                    Ok(body) => body,
                    Err(e) if e.is_user_facing() => {
                        warn!(function = name, "function failed to compile");
                        self.report(e);
                        FunctionBody {
                            locals: Vec::new(),
                            code: vec![Instruction::Unreachable],
                        }
                    }
                    Err(e) => return Err(e),
                };
                self.module.define_function(&func, body)?;
                if let Some(entry) = self.functions.get_mut(name) {
                    entry.state = CompileState::Done;
                }
                Ok(Some((func, signature)))
            }
            _ => Err(CodegenError::Internal(format!(
                "function `{name}` is in an inconsistent state"
            ))),
        }
    }

    #[instrument(skip_all, fields(function = %decl.name.name))]
    fn compile_function(&mut self, decl: &'p FunctionDecl, signature: &Signature) -> CodegenResult<FunctionBody> {
        let params: Vec<(String, Ty)> = decl
            .params
            .iter()
            .zip(&signature.params)
            .map(|(p, ty)| (p.name.name.clone(), ty.clone()))
            .collect();

        let mut ctx = FuncContext::new(self, &signature.params, signature.ret.clone())?;
        ctx.bind_params(&params)?;

        let mut code = Vec::new();
        ctx.prologue(&mut code);
        let value = stmt::emit_block(&decl.body, signature.ret.as_ref(), &mut ctx, &mut code)?;
        stmt::emit_result(value, decl.body.span, &mut ctx, &mut code)?;
        ctx.epilogue(&mut code);

        let locals = ctx.finish()?;
        let frame_bytes = ctx.stack.size()?;
        debug!(
            frame_bytes,
            locals = ctx.regs.local_count(),
            instructions = code.len(),
            "function compiled"
        );
        Ok(FunctionBody { locals, code })
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    fn push_error(&mut self, code: ErrorCode, message: String, span: Span) {
        let error = FerruleError::new(&self.config.source_name, code, message, span);
        self.errors.push_error(error);
    }

    fn report(&mut self, error: CodegenError) {
        match error {
            CodegenError::Semantic(errors) => {
                for e in errors {
                    self.errors.push_error(e);
                }
            }
            CodegenError::Diagnostics(batch) => self.errors.extend(batch),
            _ => {}
        }
    }
}
