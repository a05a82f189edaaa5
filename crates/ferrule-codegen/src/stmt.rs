//! Statement and block code generation.

use std::rc::Rc;

use ferrule_types::ast::*;
use ferrule_types::{ErrorCode, Span};

use crate::context::{describe, Address, Binding, FuncContext, Source, StructVar, Value};
use crate::error::{CodegenError, CodegenResult};
use crate::expr::{emit_expr, emit_store};
use crate::instr::{Instruction, NumericOp, Offset};
use crate::layout::Ty;
use crate::linear::Ownership;
use crate::types::BlockType;

/// Emit a block in its own scope and return the value of its tail.
///
/// A structure tail always comes back as a temporary, so it outlives the
/// locals the block frees on exit.
pub fn emit_block(
    block: &Block,
    expected: Option<&Ty>,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    ctx.push_scope();
    let value = emit_block_body(block, expected, ctx, out)?;
    ctx.pop_scope()?;
    Ok(value)
}

fn emit_block_body(
    block: &Block,
    expected: Option<&Ty>,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let mut diverges = false;
    for stmt in &block.stmts {
        diverges |= emit_stmt(stmt, ctx, out)?;
    }

    let value = match block.tail.as_deref() {
        Some(tail) => match emit_expr(tail, expected, ctx, out)? {
            Value::Struct(sv) => Value::Struct(ctx.materialize(sv, tail.span, out)?),
            other => other,
        },
        None => Value::Unit,
    };
    if diverges {
        ctx.discard(value, out)?;
        return Ok(Value::Never);
    }
    Ok(value)
}

/// Emit one statement. Returns `true` when control cannot continue past it.
pub fn emit_stmt(
    stmt: &Stmt,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<bool> {
    match stmt {
        Stmt::Let(binding) => emit_let(binding, ctx, out),
        Stmt::Set(set) => emit_set(set, ctx, out),
        Stmt::While(w) => emit_while(w, ctx, out),
        Stmt::Return(ret) => emit_return(ret, ctx, out),
        Stmt::Expr(s) => {
            let value = emit_expr(&s.expr, None, ctx, out)?;
            let never = matches!(value, Value::Never);
            ctx.discard(value, out)?;
            Ok(never)
        }
    }
}

// ── let ──────────────────────────────────────────────────────────────────────

fn emit_let(
    binding: &LetBinding,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<bool> {
    let name = binding.name.name.as_str();
    let declared = match &binding.type_ann {
        Some(ann) => Some(
            ctx.layouts
                .resolve(ann, ctx.compiler.file())
                .map_err(CodegenError::semantic)?,
        ),
        None => None,
    };

    let Some(init) = &binding.value else {
        return match declared {
            Some(ty) if ty.is_struct() => {
                // Fields are defined one by one with `set`.
                let (slot, addr) = ctx.alloc_struct(&ty)?;
                let linear = ctx.linear.new_value(name, ctx.layouts.shape(&ty));
                ctx.declare(
                    name,
                    Binding::Struct(StructVar {
                        ty,
                        addr,
                        linear,
                        slot: Some(slot),
                    }),
                );
                Ok(false)
            }
            Some(ty) => Err(ctx.error(
                ErrorCode::MISSING_VALUE,
                format!("`{name}` of type `{ty}` needs an initial value"),
                binding.span,
            )),
            None => Err(ctx.error(
                ErrorCode::MISSING_VALUE,
                format!("`{name}` needs a type or an initial value"),
                binding.span,
            )),
        };
    };

    let value = emit_expr(init, declared.as_ref(), ctx, out)?;
    if let Some(ty) = &declared {
        check_declared(ty, &value, init.span, ctx)?;
    }
    match value {
        Value::Never => Ok(true),
        Value::Unit => Err(ctx.error(
            ErrorCode::MISSING_VALUE,
            format!("the initializer of `{name}` produces no value"),
            init.span,
        )),
        Value::Scalar(ty) => {
            let local = ctx.regs.allocate(ty.val_type())?;
            out.push(Instruction::LocalSet(local.clone()));
            ctx.declare(name, Binding::Scalar { ty, local });
            Ok(false)
        }
        Value::Struct(sv) => {
            let sv = ctx.materialize(sv, init.span, out)?;
            let Source::Temp(slot) = sv.source else {
                return Err(CodegenError::Internal("materialized value is not a temporary".into()));
            };
            let linear = ctx.linear.new_value(name, ctx.layouts.shape(&sv.ty));
            ctx.define(linear, binding.span)?;
            ctx.declare(
                name,
                Binding::Struct(StructVar {
                    ty: sv.ty,
                    addr: sv.addr,
                    linear,
                    slot: Some(slot),
                }),
            );
            Ok(false)
        }
    }
}

fn check_declared(ty: &Ty, value: &Value, span: Span, ctx: &FuncContext<'_, '_>) -> CodegenResult<()> {
    match value {
        Value::Scalar(actual) if actual != ty => Err(ctx.mismatch(ty, value, span)),
        Value::Struct(sv) if &sv.ty != ty => Err(ctx.mismatch(ty, value, span)),
        _ => Ok(()),
    }
}

// ── set ──────────────────────────────────────────────────────────────────────

fn emit_set(
    set: &SetStmt,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<bool> {
    let Some((root, path)) = set.target.split_first() else {
        return Err(CodegenError::Internal("assignment without a target".into()));
    };
    let Some(binding) = ctx.lookup(&root.name).cloned() else {
        return Err(ctx.error(
            ErrorCode::UNRESOLVED_NAME,
            format!("cannot find `{}` in this scope", root.name),
            root.span,
        ));
    };

    match binding {
        Binding::Scalar { ty, local } => {
            if let Some(segment) = path.first() {
                return Err(ctx.error(
                    ErrorCode::NOT_A_STRUCT,
                    format!("`{ty}` has no field `{}`", segment.name),
                    segment.span,
                ));
            }
            let value = emit_expr(&set.value, Some(&ty), ctx, out)?;
            ctx.expect_scalar(&value, &ty, set.value.span)?;
            out.push(Instruction::LocalSet(local));
            Ok(matches!(value, Value::Never))
        }
        Binding::Struct(var) => {
            let layouts = Rc::clone(&ctx.layouts);
            let mut ty = var.ty;
            let mut addr = var.addr;
            let mut node = var.linear;
            for segment in path {
                let Some(field) = ty
                    .struct_name()
                    .and_then(|n| layouts.get(n))
                    .and_then(|l| l.field(&segment.name))
                else {
                    let code = if ty.is_struct() {
                        ErrorCode::UNKNOWN_FIELD
                    } else {
                        ErrorCode::NOT_A_STRUCT
                    };
                    return Err(ctx.error(
                        code,
                        format!("`{ty}` has no field `{}`", segment.name),
                        segment.span,
                    ));
                };
                addr = addr.offset_by(field.offset)?;
                node = ctx.linear.get(node, &segment.name).ok_or_else(|| {
                    CodegenError::Internal(format!("ownership node has no field `{}`", segment.name))
                })?;
                ty = field.ty.clone();
            }

            if matches!(ctx.linear.loan(node), Some(Ownership::ReadLoan)) {
                return Err(ctx.error(
                    ErrorCode::INVALID_ASSIGNMENT_TARGET,
                    format!("cannot assign to `{}` here: it is only borrowed for reading", ctx.linear.path(node)),
                    set.span,
                ));
            }
            emit_store(&set.value, &ty, &addr, ctx, out)?;
            ctx.define(node, set.span)?;
            Ok(false)
        }
    }
}

// ── while ────────────────────────────────────────────────────────────────────

/// `block { loop { cond; i32.eqz; br_if 1; body; br 0 } }`
///
/// The condition sees every outer structure through a read loan and the
/// body through a write loan; the body's effects are joined back as if it
/// might not have run.
fn emit_while(
    w: &WhileStmt,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<bool> {
    let cp = ctx.stack.checkpoint()?;
    let vars = ctx.struct_bindings();

    ctx.fork_vars(&vars, Some(Ownership::ReadLoan));
    let mut inner = Vec::new();
    let cond = emit_expr(&w.condition, Some(&Ty::Bool), ctx, &mut inner)?;
    ctx.expect_scalar(&cond, &Ty::Bool, w.condition.span)?;
    for &(key, original) in &vars {
        ctx.set_linear(key, original);
    }
    inner.push(Instruction::Numeric(NumericOp::I32Eqz));
    inner.push(Instruction::BrIf(1));

    ctx.fork_vars(&vars, Some(Ownership::WriteLoan));
    let body = emit_block(&w.body, None, ctx, &mut inner)?;
    ctx.discard(body, &mut inner)?;
    ctx.join_optional(&vars);
    inner.push(Instruction::Br(0));

    ctx.stack.rewind(cp)?;
    ctx.stack.restore(cp)?;

    out.push(Instruction::Block(
        BlockType::Empty,
        vec![Instruction::Loop(BlockType::Empty, inner)],
    ));
    Ok(false)
}

// ── return ───────────────────────────────────────────────────────────────────

fn emit_return(
    ret: &ReturnStmt,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<bool> {
    let value = match &ret.value {
        Some(expr) => {
            let expected = ctx.ret.clone();
            emit_expr(expr, expected.as_ref(), ctx, out)?
        }
        None => Value::Unit,
    };
    let span = ret.value.as_ref().map_or(ret.span, |e| e.span);
    emit_result(value, span, ctx, out)?;
    ctx.epilogue(out);
    out.push(Instruction::Return);
    Ok(true)
}

/// Hand `value` back as the function result: left on the operand stack for
/// a primitive, moved through the out-pointer for a structure.
pub fn emit_result(
    value: Value,
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<()> {
    match (ctx.ret.clone(), value) {
        (_, Value::Never) | (None, Value::Unit) => Ok(()),
        (None, other) => Err(ctx.error(
            ErrorCode::TYPE_MISMATCH,
            format!("this function returns nothing, found {}", describe(&other)),
            span,
        )),
        (Some(ty), Value::Unit) => Err(ctx.error(
            ErrorCode::MISSING_VALUE,
            format!("expected a `{ty}` result, found no value"),
            span,
        )),
        (Some(ty), value) if ty.is_struct() => {
            let sv = ctx.expect_struct(value, &ty, span)?;
            let base = ctx
                .out_ptr
                .clone()
                .ok_or_else(|| CodegenError::Internal("structure result without an out-pointer".into()))?;
            let dst = Address {
                base,
                offset: Offset::fixed(0),
            };
            ctx.move_into(&sv, &dst, span, out)
        }
        (Some(ty), value) => ctx.expect_scalar(&value, &ty, span),
    }
}
