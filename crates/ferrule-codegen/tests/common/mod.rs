//! Hand-built ASTs and a `wasmi` harness shared by the integration tests.
//!
//! There is no Ferrule parser in this workspace, so programs are assembled
//! from the builders below. Spans are synthetic: every node sits on line 0
//! unless a test pins it with [`at`] or [`stmt_at`] to check diagnostics.

#![allow(dead_code)]

use ferrule_codegen::{compile, CodegenConfig, CodegenError};
use ferrule_types::ast::*;
use ferrule_types::{FerruleError, Span};

// ══════════════════════════════════════════════════════════════════════════════
// Spans
// ══════════════════════════════════════════════════════════════════════════════

pub fn line(n: u32) -> Span {
    Span::new(n, 1, n, 80)
}

fn nowhere() -> Span {
    line(0)
}

/// Pin an expression to a source line.
pub fn at(n: u32, mut expr: Expr) -> Expr {
    expr.span = line(n);
    expr
}

/// Pin a statement to a source line.
pub fn stmt_at(n: u32, stmt: Stmt) -> Stmt {
    let span = line(n);
    match stmt {
        Stmt::Let(mut s) => {
            s.span = span;
            Stmt::Let(s)
        }
        Stmt::Set(mut s) => {
            s.span = span;
            Stmt::Set(s)
        }
        Stmt::While(mut s) => {
            s.span = span;
            Stmt::While(s)
        }
        Stmt::Return(mut s) => {
            s.span = span;
            Stmt::Return(s)
        }
        Stmt::Expr(mut s) => {
            s.span = span;
            Stmt::Expr(s)
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Types
// ══════════════════════════════════════════════════════════════════════════════

pub fn ty(name: &str) -> TypeAnnotation {
    let kind = match name {
        "i32" => TypeKind::I32,
        "i64" => TypeKind::I64,
        "f32" => TypeKind::F32,
        "f64" => TypeKind::F64,
        "bool" => TypeKind::Bool,
        other => TypeKind::Named(other.to_string()),
    };
    TypeAnnotation::new(kind, nowhere())
}

fn id(name: &str) -> Ident {
    Ident::new(name, nowhere())
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

fn expr(kind: ExprKind) -> Expr {
    Expr::new(kind, nowhere())
}

pub fn num(value: f64) -> Expr {
    expr(ExprKind::NumberLit(value))
}

pub fn boolean(value: bool) -> Expr {
    expr(ExprKind::BoolLit(value))
}

pub fn var(name: &str) -> Expr {
    expr(ExprKind::Identifier(name.to_string()))
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call {
        name: id(name),
        args,
    })
}

pub fn field(object: Expr, name: &str) -> Expr {
    expr(ExprKind::FieldAccess {
        object: Box::new(object),
        field: id(name),
    })
}

pub fn bin(left: Expr, op: BinOp, right: Expr) -> Expr {
    expr(ExprKind::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

pub fn neg(operand: Expr) -> Expr {
    expr(ExprKind::Unary {
        op: UnaryOp::Neg,
        operand: Box::new(operand),
    })
}

pub fn not(operand: Expr) -> Expr {
    expr(ExprKind::Unary {
        op: UnaryOp::Not,
        operand: Box::new(operand),
    })
}

pub fn paren(inner: Expr) -> Expr {
    expr(ExprKind::Paren(Box::new(inner)))
}

/// `Name { field: value, ... }`
pub fn lit(name: &str, fields: Vec<(&str, Expr)>) -> Expr {
    expr(ExprKind::StructLit {
        name: id(name),
        fields: fields
            .into_iter()
            .map(|(name, value)| FieldInit {
                name: id(name),
                value,
            })
            .collect(),
    })
}

pub fn if_else(condition: Expr, then_block: Block, else_block: Option<Block>) -> Expr {
    expr(ExprKind::If(Box::new(IfExpr {
        condition,
        then_block,
        else_branch: else_block.map(ElseBranch::Block),
        span: nowhere(),
    })))
}

pub fn block_expr(block: Block) -> Expr {
    expr(ExprKind::Block(Box::new(block)))
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements and blocks
// ══════════════════════════════════════════════════════════════════════════════

pub fn block(stmts: Vec<Stmt>, tail: Option<Expr>) -> Block {
    Block {
        stmts,
        tail: tail.map(Box::new),
        span: nowhere(),
    }
}

/// A block with only a tail expression.
pub fn value(tail: Expr) -> Block {
    block(vec![], Some(tail))
}

pub fn let_(name: &str, type_ann: Option<&str>, value: Option<Expr>) -> Stmt {
    Stmt::Let(LetBinding {
        name: id(name),
        type_ann: type_ann.map(ty),
        value,
        span: nowhere(),
    })
}

pub fn set(path: &[&str], value: Expr) -> Stmt {
    Stmt::Set(SetStmt {
        target: path.iter().map(|segment| id(segment)).collect(),
        value,
        span: nowhere(),
    })
}

pub fn while_(condition: Expr, body: Block) -> Stmt {
    Stmt::While(WhileStmt {
        condition,
        body,
        span: nowhere(),
    })
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return(ReturnStmt {
        value,
        span: nowhere(),
    })
}

pub fn stmt(expr: Expr) -> Stmt {
    Stmt::Expr(ExprStmt {
        expr,
        span: nowhere(),
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Declarations
// ══════════════════════════════════════════════════════════════════════════════

pub fn func(name: &str, params: &[(&str, &str)], ret: Option<&str>, body: Block) -> FunctionDecl {
    FunctionDecl {
        name: id(name),
        params: params
            .iter()
            .map(|(name, type_name)| Param {
                name: id(name),
                type_ann: ty(type_name),
                span: nowhere(),
            })
            .collect(),
        ret: ret.map(ty),
        body,
        exported: false,
        span: nowhere(),
    }
}

pub fn export(name: &str, params: &[(&str, &str)], ret: Option<&str>, body: Block) -> FunctionDecl {
    FunctionDecl {
        exported: true,
        ..func(name, params, ret, body)
    }
}

pub fn structure(name: &str, fields: &[(&str, &str)]) -> StructDecl {
    StructDecl {
        name: id(name),
        fields: fields
            .iter()
            .map(|(name, type_name)| FieldDecl {
                name: id(name),
                type_ann: ty(type_name),
                span: nowhere(),
            })
            .collect(),
        span: nowhere(),
    }
}

pub fn import(module: &str, field: &str, binding: &str, params: &[&str], ret: Option<&str>) -> ImportDecl {
    ImportDecl {
        module: module.to_string(),
        field: field.to_string(),
        binding: id(binding),
        params: params.iter().map(|p| ty(p)).collect(),
        ret: ret.map(ty),
        span: nowhere(),
    }
}

pub fn program(structs: Vec<StructDecl>, imports: Vec<ImportDecl>, functions: Vec<FunctionDecl>) -> Program {
    Program {
        structs,
        imports,
        functions,
        span: nowhere(),
    }
}

/// `struct Point { x: i32, y: i32 }`
pub fn point() -> StructDecl {
    structure("Point", &[("x", "i32"), ("y", "i32")])
}

// ══════════════════════════════════════════════════════════════════════════════
// Compilation
// ══════════════════════════════════════════════════════════════════════════════

/// Compile with the default config (panics on error).
pub fn compile_ok(program: &Program) -> Vec<u8> {
    compile(program, &CodegenConfig::default()).unwrap_or_else(|e| panic!("codegen failed: {e}"))
}

/// Compile a program expected to be rejected and return its diagnostics.
pub fn diagnostics(program: &Program) -> Vec<FerruleError> {
    match compile(program, &CodegenConfig::default()) {
        Err(CodegenError::Diagnostics(errors)) => errors.errors,
        Err(other) => panic!("expected diagnostics, got {other}"),
        Ok(_) => panic!("expected diagnostics, program compiled"),
    }
}

/// Codes of all diagnostics, in report order.
pub fn codes(errors: &[FerruleError]) -> Vec<u16> {
    errors.iter().map(|e| e.code.0).collect()
}

// ══════════════════════════════════════════════════════════════════════════════
// Execution
// ══════════════════════════════════════════════════════════════════════════════

/// Values the host imports record while the module runs.
#[derive(Default)]
pub struct HostState {
    pub printed: Vec<i32>,
}

pub struct Instance {
    pub store: wasmi::Store<HostState>,
    pub instance: wasmi::Instance,
}

impl Instance {
    /// Instantiate `wasm`, providing `env.print(i32)`.
    pub fn new(wasm: &[u8]) -> Self {
        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, wasm).expect("module should load");
        let mut store = wasmi::Store::new(&engine, HostState::default());
        let mut linker = <wasmi::Linker<HostState>>::new(&engine);
        linker
            .func_wrap(
                "env",
                "print",
                |mut caller: wasmi::Caller<'_, HostState>, value: i32| {
                    caller.data_mut().printed.push(value);
                },
            )
            .expect("host function should link");
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("module should instantiate")
            .start(&mut store)
            .expect("start should succeed");
        Self { store, instance }
    }

    pub fn call<P, R>(&mut self, name: &str, args: P) -> R
    where
        P: wasmi::WasmParams,
        R: wasmi::WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&self.store, name)
            .unwrap_or_else(|e| panic!("export `{name}` has the wrong type: {e}"));
        func.call(&mut self.store, args)
            .unwrap_or_else(|e| panic!("`{name}` trapped: {e}"))
    }

    pub fn stack_pointer(&self) -> i32 {
        let global = self
            .instance
            .get_global(&self.store, "__stack_pointer")
            .expect("stack pointer should be exported");
        match global.get(&self.store) {
            wasmi::Val::I32(value) => value,
            other => panic!("stack pointer is not an i32: {other:?}"),
        }
    }

    pub fn printed(&self) -> &[i32] {
        &self.store.data().printed
    }
}
