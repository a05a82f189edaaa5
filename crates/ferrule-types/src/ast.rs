//! AST node types for the Ferrule language.
//!
//! This is the contract between the (external) parser and the code
//! generator. Every node carries a [`Span`] for diagnostics, and node kinds
//! are closed enums so the backend can match them exhaustively.
//! Large recursive types are boxed to keep enum sizes reasonable.

use crate::Span;

// ══════════════════════════════════════════════════════════════════════════════
// Top Level
// ══════════════════════════════════════════════════════════════════════════════

/// A complete compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub structs: Vec<StructDecl>,
    pub imports: Vec<ImportDecl>,
    pub functions: Vec<FunctionDecl>,
    pub span: Span,
}

/// A spanned identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Declarations
// ══════════════════════════════════════════════════════════════════════════════

/// `struct Name { field: Type, ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: Ident,
    pub fields: Vec<FieldDecl>,
    pub span: Span,
}

/// A single structure field: `x: i32`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: Ident,
    pub type_ann: TypeAnnotation,
    pub span: Span,
}

/// `import "module" "name" fn binding(params) -> ret`
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub module: String,
    pub field: String,
    /// Name the function is called by inside the program.
    pub binding: Ident,
    pub params: Vec<TypeAnnotation>,
    pub ret: Option<TypeAnnotation>,
    pub span: Span,
}

/// `[export] fn name(params) -> ret { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub ret: Option<TypeAnnotation>,
    pub body: Block,
    pub exported: bool,
    pub span: Span,
}

/// A typed parameter: `name: Type`
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub type_ann: TypeAnnotation,
    pub span: Span,
}

/// `{ stmts...; tail }`: the optional tail expression is the block's value.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub tail: Option<Box<Expr>>,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name[: Type] [= expr]`
    Let(LetBinding),
    /// `name.field.nested = expr` or `name = expr`
    Set(SetStmt),
    /// `while cond { ... }`
    While(WhileStmt),
    /// `return [expr]`
    Return(ReturnStmt),
    /// A bare expression (value is discarded).
    Expr(ExprStmt),
}

/// `let name: Type = expr`. The initializer may be omitted for structure
/// types, in which case fields are assigned one by one afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct LetBinding {
    pub name: Ident,
    pub type_ann: Option<TypeAnnotation>,
    pub value: Option<Expr>,
    pub span: Span,
}

/// `target = value`
#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    /// Path segments: `["point", "x"]`
    pub target: Vec<Ident>,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStmt {
    pub condition: Expr,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub value: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub expr: Expr,
    pub span: Span,
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

/// An expression node. Uses `Box` for recursive variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    // ── Literals ──
    /// `42`, `3.14`, typed by context.
    NumberLit(f64),
    /// `true` / `false`
    BoolLit(bool),
    /// `Point { x: 1, y: 2 }`
    StructLit { name: Ident, fields: Vec<FieldInit> },

    // ── Names & Calls ──
    Identifier(String),
    /// `func(args...)`
    Call { name: Ident, args: Vec<Expr> },
    /// `expr.field`
    FieldAccess { object: Box<Expr>, field: Ident },

    // ── Operators ──
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },

    // ── Control Flow ──
    If(Box<IfExpr>),
    Block(Box<Block>),

    // ── Grouping ──
    Paren(Box<Expr>),
}

/// `field: expr` inside a structure literal.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInit {
    pub name: Ident,
    pub value: Expr,
}

/// Binary operators (in precedence order, lowest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Logical
    Or,
    And,
    // Comparison
    Eq,
    NotEq,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    /// Returns the operator symbol for error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Less => "<",
            BinOp::Greater => ">",
            BinOp::LessEq => "<=",
            BinOp::GreaterEq => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq
                | BinOp::NotEq
                | BinOp::Less
                | BinOp::Greater
                | BinOp::LessEq
                | BinOp::GreaterEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `not x`
    Not,
}

/// `if cond { ... } [else { ... }]`
#[derive(Debug, Clone, PartialEq)]
pub struct IfExpr {
    pub condition: Expr,
    pub then_block: Block,
    pub else_branch: Option<ElseBranch>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElseBranch {
    Block(Block),
    ElseIf(Box<IfExpr>),
}

// ══════════════════════════════════════════════════════════════════════════════
// Type Annotations
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct TypeAnnotation {
    pub kind: TypeKind,
    pub span: Span,
}

impl TypeAnnotation {
    pub fn new(kind: TypeKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    I32,
    I64,
    F32,
    F64,
    Bool,
    /// User-defined structure name.
    Named(String),
}
