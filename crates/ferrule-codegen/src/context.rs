//! Per-function code generation state.
//!
//! A [`FuncContext`] owns everything that lives for one function body: the
//! local and stack-frame allocators, the ownership arena, and the lexical
//! scopes. It borrows the module-wide [`Compiler`] so calls can compile their
//! callees on demand.
//!
//! Frame layout at run time:
//!
//! ```text
//!   __stack_pointer (on entry)
//!   ┌──────────────────────────┐ ← fp + frame_size
//!   │ structure slots          │
//!   └──────────────────────────┘ ← fp  (= __stack_pointer while running)
//! ```

use std::rc::Rc;

use ferrule_types::{ErrorCode, FerruleError, Span};

use crate::compiler::Compiler;
use crate::error::{CodegenError, CodegenResult};
use crate::instr::{Instruction, MemArg, NumericOp, Offset};
use crate::latent::Latent;
use crate::layout::{Layouts, Ty};
use crate::linear::{CompositionError, LinearArena, LinearError, LinearId, Ownership};
use crate::register::{LocalRef, RegisterAllocator};
use crate::stack::{StackAllocation, StackAllocator};
use crate::types::ValType;

// ══════════════════════════════════════════════════════════════════════════════
// Values and places
// ══════════════════════════════════════════════════════════════════════════════

/// A memory address: the value of a local plus a static offset.
#[derive(Debug, Clone)]
pub struct Address {
    pub base: LocalRef,
    pub offset: Offset,
}

impl Address {
    pub fn offset_by(&self, bytes: u32) -> CodegenResult<Address> {
        Ok(Address {
            base: self.base.clone(),
            offset: self.offset.plus(bytes)?,
        })
    }

    /// Push the absolute address onto the operand stack.
    pub fn push(&self, out: &mut Vec<Instruction>) {
        out.push(Instruction::LocalGet(self.base.clone()));
        out.push(Instruction::I32ConstLatent(self.offset.clone()));
        out.push(Instruction::Numeric(NumericOp::I32Add));
    }

    pub fn load(&self, ty: ValType, out: &mut Vec<Instruction>) {
        out.push(Instruction::LocalGet(self.base.clone()));
        out.push(Instruction::Load(ty, MemArg::natural(ty, self.offset.clone())));
    }
}

/// Where a structure value lives and who is responsible for it.
#[derive(Debug, Clone)]
pub enum Source {
    /// A frame slot owned by the expression; the consumer frees it.
    Temp(StackAllocation),
    /// A variable or a field of one; using it by value moves it.
    Var(LinearId),
}

#[derive(Debug, Clone)]
pub struct StructValue {
    pub ty: Ty,
    pub addr: Address,
    pub source: Source,
}

/// Result of compiling an expression.
#[derive(Debug, Clone)]
pub enum Value {
    /// A primitive left on the operand stack.
    Scalar(Ty),
    /// A structure in linear memory; nothing on the operand stack.
    Struct(StructValue),
    Unit,
    /// Control never reaches the end of the expression.
    Never,
}

// ══════════════════════════════════════════════════════════════════════════════
// Scopes
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct StructVar {
    pub ty: Ty,
    pub addr: Address,
    pub linear: LinearId,
    /// Frame slot owned by the variable; parameters have none.
    pub slot: Option<StackAllocation>,
}

#[derive(Debug, Clone)]
pub enum Binding {
    Scalar { ty: Ty, local: LocalRef },
    Struct(StructVar),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingKey {
    scope: usize,
    index: usize,
}

#[derive(Default)]
struct Scope {
    bindings: Vec<(String, Binding)>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Function context
// ══════════════════════════════════════════════════════════════════════════════

pub struct FuncContext<'c, 'p> {
    pub compiler: &'c mut Compiler<'p>,
    pub layouts: Rc<Layouts>,
    pub regs: RegisterAllocator,
    pub stack: StackAllocator,
    pub linear: LinearArena,
    /// Base of this function's frame.
    pub frame_ptr: LocalRef,
    /// Hidden destination of a structure result.
    pub out_ptr: Option<LocalRef>,
    pub ret: Option<Ty>,
    frame_size: Latent<u32>,
    scopes: Vec<Scope>,
}

impl<'c, 'p> FuncContext<'c, 'p> {
    pub fn new(compiler: &'c mut Compiler<'p>, params: &[Ty], ret: Option<Ty>) -> CodegenResult<Self> {
        let struct_ret = ret.as_ref().is_some_and(Ty::is_struct);
        let mut wasm_params = Vec::with_capacity(params.len() + 1);
        if struct_ret {
            wasm_params.push(ValType::I32);
        }
        wasm_params.extend(params.iter().map(Ty::val_type));

        let mut regs = RegisterAllocator::new(&wasm_params);
        let frame_ptr = regs.allocate(ValType::I32)?;
        let out_ptr = if struct_ret { regs.param(0) } else { None };
        let stack = StackAllocator::from_config(compiler.config());
        let frame_size = stack.latent_size();
        Ok(Self {
            layouts: Rc::clone(&compiler.layouts),
            compiler,
            regs,
            stack,
            linear: LinearArena::new(),
            frame_ptr,
            out_ptr,
            ret,
            frame_size,
            scopes: vec![Scope::default()],
        })
    }

    /// Bind the declared parameters. Structure parameters arrive as owned
    /// pointers to complete values.
    pub fn bind_params(&mut self, params: &[(String, Ty)]) -> CodegenResult<()> {
        let first = usize::from(self.out_ptr.is_some());
        for (i, (name, ty)) in params.iter().enumerate() {
            let local = self.regs.param(first + i).ok_or_else(|| {
                CodegenError::Internal(format!("missing parameter slot for `{name}`"))
            })?;
            let binding = if ty.is_struct() {
                let linear = self.linear.new_value(name, self.layouts.shape(ty));
                self.linear
                    .mark_defined(linear)
                    .map_err(|e| CodegenError::Internal(e.to_string()))?;
                Binding::Struct(StructVar {
                    ty: ty.clone(),
                    addr: Address {
                        base: local,
                        offset: Offset::fixed(0),
                    },
                    linear,
                    slot: None,
                })
            } else {
                Binding::Scalar {
                    ty: ty.clone(),
                    local,
                }
            };
            self.declare(name, binding);
        }
        Ok(())
    }

    // ── Frame ────────────────────────────────────────────────────────────

    /// `fp = __stack_pointer -= frame_size`
    pub fn prologue(&self, out: &mut Vec<Instruction>) {
        let sp = self.compiler.stack_pointer.clone();
        out.push(Instruction::GlobalGet(sp.clone()));
        out.push(Instruction::I32ConstLatent(Offset::latent(self.frame_size.clone())));
        out.push(Instruction::Numeric(NumericOp::I32Sub));
        out.push(Instruction::LocalTee(self.frame_ptr.clone()));
        out.push(Instruction::GlobalSet(sp));
    }

    /// `__stack_pointer = fp + frame_size`
    pub fn epilogue(&self, out: &mut Vec<Instruction>) {
        out.push(Instruction::LocalGet(self.frame_ptr.clone()));
        out.push(Instruction::I32ConstLatent(Offset::latent(self.frame_size.clone())));
        out.push(Instruction::Numeric(NumericOp::I32Add));
        out.push(Instruction::GlobalSet(self.compiler.stack_pointer.clone()));
    }

    /// A fresh frame slot sized for `ty`.
    pub fn alloc_struct(&mut self, ty: &Ty) -> CodegenResult<(StackAllocation, Address)> {
        let (size, align) = self.layouts.size_align(ty);
        let slot = self.stack.allocate(size, align)?;
        let addr = self.frame_address(&slot);
        Ok((slot, addr))
    }

    /// Return a slot to the frame. Empty structures never occupied bytes.
    pub fn release(&mut self, slot: &StackAllocation) -> CodegenResult<()> {
        if slot.size() > 0 {
            self.stack.free(slot)?;
        }
        Ok(())
    }

    /// Empty structures are never placed, so any address serves; they use the
    /// frame base.
    pub fn frame_address(&self, slot: &StackAllocation) -> Address {
        let offset = if slot.size() == 0 {
            Offset::fixed(0)
        } else {
            Offset::latent(slot.offset().clone())
        };
        Address {
            base: self.frame_ptr.clone(),
            offset,
        }
    }

    // ── Scopes ───────────────────────────────────────────────────────────

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Leave the innermost scope, returning its locals and frame slots.
    pub fn pop_scope(&mut self) -> CodegenResult<()> {
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| CodegenError::Internal("scope stack underflow".into()))?;
        for (_, binding) in scope.bindings.into_iter().rev() {
            match binding {
                Binding::Scalar { local, .. } if !local.is_param() => self.regs.free(&local)?,
                Binding::Scalar { .. } => {}
                Binding::Struct(var) => {
                    if let Some(slot) = var.slot {
                        self.release(&slot)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn declare(&mut self, name: &str, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.bindings.push((name.to_string(), binding));
        }
    }

    /// Innermost binding of `name`; later declarations shadow earlier ones.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| {
            scope
                .bindings
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, b)| b)
        })
    }

    /// Every structure variable in scope with its current ownership node.
    pub fn struct_bindings(&self) -> Vec<(BindingKey, LinearId)> {
        let mut out = Vec::new();
        for (scope_idx, scope) in self.scopes.iter().enumerate() {
            for (index, (_, binding)) in scope.bindings.iter().enumerate() {
                if let Binding::Struct(var) = binding {
                    out.push((
                        BindingKey {
                            scope: scope_idx,
                            index,
                        },
                        var.linear,
                    ));
                }
            }
        }
        out
    }

    pub fn set_linear(&mut self, key: BindingKey, linear: LinearId) {
        if let Some((_, Binding::Struct(var))) = self
            .scopes
            .get_mut(key.scope)
            .and_then(|s| s.bindings.get_mut(key.index))
        {
            var.linear = linear;
        }
    }

    pub fn linear_of(&self, key: BindingKey) -> Option<LinearId> {
        match self.scopes.get(key.scope)?.bindings.get(key.index)? {
            (_, Binding::Struct(var)) => Some(var.linear),
            _ => None,
        }
    }

    /// Give every variable in `vars` a private copy of its ownership state,
    /// optionally under a loan.
    pub fn fork_vars(&mut self, vars: &[(BindingKey, LinearId)], loan: Option<Ownership>) {
        for &(key, original) in vars {
            let copy = self.linear.clone_value(original);
            if let Some(loan) = loan {
                self.linear.borrow(copy, loan);
            }
            self.set_linear(key, copy);
        }
    }

    /// Fold the state of code that may not run back into the state it
    /// started from, and rebind the variables to it.
    pub fn join_optional(&mut self, vars: &[(BindingKey, LinearId)]) {
        for &(key, original) in vars {
            if let Some(branch) = self.linear_of(key) {
                self.linear.infuse(original, branch);
            }
            self.set_linear(key, original);
        }
    }

    pub fn current_states(&self, vars: &[(BindingKey, LinearId)]) -> Vec<LinearId> {
        vars.iter()
            .map(|&(key, original)| self.linear_of(key).unwrap_or(original))
            .collect()
    }

    // ── Ownership checks ─────────────────────────────────────────────────

    pub fn error(&self, code: ErrorCode, message: impl Into<String>, span: Span) -> CodegenError {
        CodegenError::semantic(FerruleError::new(
            self.compiler.file(),
            code,
            message,
            span,
        ))
    }

    pub fn linear_error(&self, error: LinearError, span: Span) -> CodegenError {
        let code = match error {
            LinearError::MoveOutOfLoan { .. } => ErrorCode::MOVE_OUT_OF_LOAN,
            LinearError::WriteToReadLoan { .. } => ErrorCode::INVALID_ASSIGNMENT_TARGET,
        };
        self.error(code, error.to_string(), span)
    }

    /// Fail with one diagnostic per missing or moved part of `id`.
    pub fn check_complete(&self, id: LinearId, span: Span) -> CodegenResult<()> {
        if !self.linear.has_composition_errors(id) {
            return Ok(());
        }
        let file = self.compiler.file();
        let errors = self
            .linear
            .composition_errors(id)
            .into_iter()
            .map(|error| match error {
                CompositionError::Missing { path } => FerruleError::new(
                    file,
                    ErrorCode::INCOMPLETE_VALUE,
                    format!("`{path}` is used before it is defined"),
                    span,
                )
                .with_suggestion(format!("assign `{path}` before this use")),
                CompositionError::Consumed { path, at } => FerruleError::new(
                    file,
                    ErrorCode::CONSUMED_VALUE,
                    format!("`{path}` was moved out and not redefined"),
                    span,
                )
                .with_related(at),
            })
            .collect();
        Err(CodegenError::Semantic(errors))
    }

    /// Move a whole structure out of its variable.
    pub fn consume(&mut self, id: LinearId, span: Span) -> CodegenResult<()> {
        self.check_complete(id, span)?;
        self.linear
            .mark_consumed(id, span)
            .map_err(|e| self.linear_error(e, span))
    }

    pub fn define(&mut self, id: LinearId, span: Span) -> CodegenResult<()> {
        self.linear
            .mark_defined(id)
            .map_err(|e| self.linear_error(e, span))
    }

    // ── Structure moves ──────────────────────────────────────────────────

    /// Primitive leaves of `ty` with their offsets, in layout order.
    pub fn leaves(&self, ty: &Ty) -> Vec<(u32, ValType)> {
        let mut out = Vec::new();
        self.collect_leaves(ty, 0, &mut out);
        out
    }

    fn collect_leaves(&self, ty: &Ty, base: u32, out: &mut Vec<(u32, ValType)>) {
        let Some(layout) = ty.struct_name().and_then(|name| self.layouts.get(name)) else {
            out.push((base, ty.val_type()));
            return;
        };
        for field in &layout.fields {
            self.collect_leaves(&field.ty, base + field.offset, out);
        }
    }

    pub fn copy_struct(
        &self,
        ty: &Ty,
        src: &Address,
        dst: &Address,
        out: &mut Vec<Instruction>,
    ) -> CodegenResult<()> {
        for (offset, vt) in self.leaves(ty) {
            let from = src.offset.plus(offset)?;
            let to = dst.offset.plus(offset)?;
            out.push(Instruction::LocalGet(dst.base.clone()));
            out.push(Instruction::LocalGet(src.base.clone()));
            out.push(Instruction::Load(vt, MemArg::natural(vt, from)));
            out.push(Instruction::Store(vt, MemArg::natural(vt, to)));
        }
        Ok(())
    }

    /// Use `value` by value: consume a variable, or hand back a temporary.
    /// Returns the temporary to free once the bytes have been read.
    pub fn take(&mut self, value: &StructValue, span: Span) -> CodegenResult<Option<StackAllocation>> {
        match &value.source {
            Source::Var(id) => {
                self.consume(*id, span)?;
                Ok(None)
            }
            Source::Temp(slot) => Ok(Some(slot.clone())),
        }
    }

    /// Move `value` into memory at `dst`.
    pub fn move_into(
        &mut self,
        value: &StructValue,
        dst: &Address,
        span: Span,
        out: &mut Vec<Instruction>,
    ) -> CodegenResult<()> {
        let temp = self.take(value, span)?;
        self.copy_struct(&value.ty, &value.addr, dst, out)?;
        if let Some(slot) = temp {
            self.release(&slot)?;
        }
        Ok(())
    }

    /// Turn a variable reference into a temporary holding its value.
    pub fn materialize(
        &mut self,
        value: StructValue,
        span: Span,
        out: &mut Vec<Instruction>,
    ) -> CodegenResult<StructValue> {
        if let Source::Temp(_) = value.source {
            return Ok(value);
        }
        let (slot, addr) = self.alloc_struct(&value.ty)?;
        self.move_into(&value, &addr, span, out)?;
        Ok(StructValue {
            ty: value.ty,
            addr,
            source: Source::Temp(slot),
        })
    }

    /// Drop a value nobody uses.
    pub fn discard(&mut self, value: Value, out: &mut Vec<Instruction>) -> CodegenResult<()> {
        match value {
            Value::Scalar(_) => out.push(Instruction::Drop),
            Value::Struct(StructValue {
                source: Source::Temp(slot),
                ..
            }) => self.release(&slot)?,
            Value::Struct(_) | Value::Unit | Value::Never => {}
        }
        Ok(())
    }

    /// Check that `value` is a primitive of type `ty` (or never produced).
    pub fn expect_scalar(&self, value: &Value, ty: &Ty, span: Span) -> CodegenResult<()> {
        match value {
            Value::Scalar(actual) if actual == ty => Ok(()),
            Value::Never => Ok(()),
            other => Err(self.mismatch(ty, other, span)),
        }
    }

    pub fn expect_struct(&self, value: Value, ty: &Ty, span: Span) -> CodegenResult<StructValue> {
        match value {
            Value::Struct(sv) if &sv.ty == ty => Ok(sv),
            other => Err(self.mismatch(ty, &other, span)),
        }
    }

    pub fn mismatch(&self, expected: &Ty, found: &Value, span: Span) -> CodegenError {
        self.error(
            ErrorCode::TYPE_MISMATCH,
            format!("expected `{expected}`, found {}", describe(found)),
            span,
        )
    }

    // ── Finish ───────────────────────────────────────────────────────────

    /// Lay out the frame and number the locals. Returns the locals table.
    pub fn finish(&mut self) -> CodegenResult<Vec<(u32, ValType)>> {
        self.stack.resolve()?;
        self.regs.finish()
    }
}

pub fn describe(value: &Value) -> String {
    match value {
        Value::Scalar(ty) => format!("`{ty}`"),
        Value::Struct(sv) => format!("`{}`", sv.ty),
        Value::Unit => "no value".to_string(),
        Value::Never => "an expression that never completes".to_string(),
    }
}
