//! Expression code generation.
//!
//! A primitive expression leaves its value on the WASM operand stack. A
//! structure expression leaves nothing on the stack: it yields a
//! [`StructValue`] saying where the bytes live and who owns them.

use std::rc::Rc;

use ferrule_types::ast::*;
use ferrule_types::{ErrorCode, Span};

use crate::binary::{f32_from_f64, i32_from_f64, integer_from_f64};
use crate::context::{describe, Address, Binding, FuncContext, Source, StructValue, Value};
use crate::error::{CodegenError, CodegenResult};
use crate::instr::{Instruction, MemArg, NumericOp};
use crate::layout::Ty;
use crate::stack::StackAllocation;
use crate::stmt::emit_block;
use crate::types::{BlockType, ValType};

/// Emit instructions for an expression. `expected` is the type the context
/// wants, used to type number literals.
pub fn emit_expr(
    expr: &Expr,
    expected: Option<&Ty>,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    match &expr.kind {
        // ── Literals ──────────────────────────────────────────────────────
        ExprKind::NumberLit(n) => emit_number(*n, expected, expr.span, ctx, out),
        ExprKind::BoolLit(b) => {
            out.push(Instruction::I32Const(i32::from(*b)));
            Ok(Value::Scalar(Ty::Bool))
        }
        ExprKind::StructLit { name, fields } => emit_struct_lit(name, fields, expr.span, ctx, out),

        // ── Names & Calls ────────────────────────────────────────────────
        ExprKind::Identifier(name) => emit_identifier(name, expr.span, ctx, out),
        ExprKind::Call { name, args } => emit_call(name, args, ctx, out),
        ExprKind::FieldAccess { object, field } => {
            emit_field_access(object, field, expr.span, ctx, out)
        }

        // ── Operators ────────────────────────────────────────────────────
        ExprKind::Binary { left, op, right } => emit_binary(left, *op, right, expected, ctx, out),
        ExprKind::Unary { op, operand } => {
            emit_unary(*op, operand, expected, expr.span, ctx, out)
        }

        // ── Control Flow ─────────────────────────────────────────────────
        ExprKind::If(if_expr) => emit_if(if_expr, expected, ctx, out),
        ExprKind::Block(block) => emit_block(block, expected, ctx, out),

        // ── Grouping ─────────────────────────────────────────────────────
        ExprKind::Paren(inner) => emit_expr(inner, expected, ctx, out),
    }
}

/// Evaluate `expr` and store its value at `dst`.
pub fn emit_store(
    expr: &Expr,
    ty: &Ty,
    dst: &Address,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<()> {
    if ty.is_struct() {
        let value = emit_expr(expr, Some(ty), ctx, out)?;
        if let Value::Never = value {
            return Ok(());
        }
        let sv = ctx.expect_struct(value, ty, expr.span)?;
        return ctx.move_into(&sv, dst, expr.span, out);
    }
    out.push(Instruction::LocalGet(dst.base.clone()));
    let value = emit_expr(expr, Some(ty), ctx, out)?;
    ctx.expect_scalar(&value, ty, expr.span)?;
    let vt = ty.val_type();
    out.push(Instruction::Store(vt, MemArg::natural(vt, dst.offset.clone())));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Literals
// ══════════════════════════════════════════════════════════════════════════════

fn emit_number(
    n: f64,
    expected: Option<&Ty>,
    span: Span,
    ctx: &FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let ty = match expected {
        Some(ty) if ty.is_numeric() => ty.clone(),
        Some(ty) => {
            return Err(ctx.error(
                ErrorCode::TYPE_MISMATCH,
                format!("expected `{ty}`, found a number"),
                span,
            ))
        }
        None if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) => Ty::I32,
        None => Ty::F64,
    };
    out.push(match ty {
        Ty::I32 => Instruction::I32Const(i32_from_f64(n)?),
        Ty::I64 => Instruction::I64Const(integer_from_f64(n)?),
        Ty::F32 => Instruction::F32Const(f32_from_f64(n)?),
        _ => Instruction::F64Const(n),
    });
    Ok(Value::Scalar(ty))
}

fn emit_struct_lit(
    name: &Ident,
    fields: &[FieldInit],
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let layouts = Rc::clone(&ctx.layouts);
    let Some(layout) = layouts.get(&name.name) else {
        return Err(ctx.error(
            ErrorCode::UNKNOWN_TYPE,
            format!("unknown structure `{}`", name.name),
            name.span,
        ));
    };

    let mut seen: Vec<&str> = Vec::with_capacity(fields.len());
    for init in fields {
        if layout.field(&init.name.name).is_none() {
            return Err(ctx.error(
                ErrorCode::UNKNOWN_FIELD,
                format!("`{}` has no field `{}`", layout.name, init.name.name),
                init.name.span,
            ));
        }
        if seen.contains(&init.name.name.as_str()) {
            return Err(ctx.error(
                ErrorCode::DUPLICATE_FIELD,
                format!("field `{}` is initialized twice", init.name.name),
                init.name.span,
            ));
        }
        seen.push(&init.name.name);
    }
    if let Some(missing) = layout.fields.iter().find(|f| !seen.contains(&f.name.as_str())) {
        return Err(ctx.error(
            ErrorCode::MISSING_VALUE,
            format!("missing field `{}` in `{}` literal", missing.name, layout.name),
            span,
        ));
    }

    let ty = Ty::Struct(Rc::clone(&layout.name));
    let (slot, addr) = ctx.alloc_struct(&ty)?;
    for init in fields {
        let Some(field) = layout.field(&init.name.name) else {
            continue;
        };
        let dst = addr.offset_by(field.offset)?;
        emit_store(&init.value, &field.ty, &dst, ctx, out)?;
    }
    Ok(Value::Struct(StructValue {
        ty,
        addr,
        source: Source::Temp(slot),
    }))
}

// ══════════════════════════════════════════════════════════════════════════════
// Names & Calls
// ══════════════════════════════════════════════════════════════════════════════

fn emit_identifier(
    name: &str,
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    match ctx.lookup(name).cloned() {
        Some(Binding::Scalar { ty, local }) => {
            out.push(Instruction::LocalGet(local));
            Ok(Value::Scalar(ty))
        }
        // Nothing is consumed yet: that is up to whoever uses the value.
        Some(Binding::Struct(var)) => Ok(Value::Struct(StructValue {
            ty: var.ty,
            addr: var.addr,
            source: Source::Var(var.linear),
        })),
        None => Err(ctx.error(
            ErrorCode::UNRESOLVED_NAME,
            format!("cannot find `{name}` in this scope"),
            span,
        )),
    }
}

fn emit_call(
    name: &Ident,
    args: &[Expr],
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let Some((func, sig)) = ctx.compiler.ensure_compiled(&name.name)? else {
        return Err(ctx.error(
            ErrorCode::UNKNOWN_FUNCTION,
            format!("cannot find function `{}`", name.name),
            name.span,
        ));
    };
    if args.len() != sig.params.len() {
        return Err(ctx.error(
            ErrorCode::WRONG_ARG_COUNT,
            format!(
                "`{}` takes {} argument(s) but {} were supplied",
                name.name,
                sig.params.len(),
                args.len()
            ),
            name.span,
        ));
    }

    // The out-pointer goes first.
    let result = match &sig.ret {
        Some(ty) if ty.is_struct() => {
            let (slot, addr) = ctx.alloc_struct(ty)?;
            addr.push(out);
            Some(StructValue {
                ty: ty.clone(),
                addr,
                source: Source::Temp(slot),
            })
        }
        _ => None,
    };

    let mut temps: Vec<StackAllocation> = Vec::new();
    for (arg, ty) in args.iter().zip(&sig.params) {
        let value = emit_expr(arg, Some(ty), ctx, out)?;
        if !ty.is_struct() {
            ctx.expect_scalar(&value, ty, arg.span)?;
            continue;
        }
        if let Value::Never = value {
            continue;
        }
        let sv = ctx.expect_struct(value, ty, arg.span)?;
        if let Some(temp) = ctx.take(&sv, arg.span)? {
            temps.push(temp);
        }
        sv.addr.push(out);
    }
    out.push(Instruction::Call(func));
    for temp in &temps {
        ctx.release(temp)?;
    }

    Ok(match (result, &sig.ret) {
        (Some(sv), _) => Value::Struct(sv),
        (None, Some(ty)) => Value::Scalar(ty.clone()),
        (None, None) => Value::Unit,
    })
}

fn emit_field_access(
    object: &Expr,
    field: &Ident,
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let base = emit_expr(object, None, ctx, out)?;
    let sv = match base {
        Value::Struct(sv) => sv,
        other => {
            return Err(ctx.error(
                ErrorCode::NOT_A_STRUCT,
                format!("{} has no field `{}`", describe(&other), field.name),
                object.span,
            ))
        }
    };
    let layouts = Rc::clone(&ctx.layouts);
    let Some(layout_field) = sv
        .ty
        .struct_name()
        .and_then(|n| layouts.get(n))
        .and_then(|l| l.field(&field.name))
    else {
        return Err(ctx.error(
            ErrorCode::UNKNOWN_FIELD,
            format!("`{}` has no field `{}`", sv.ty, field.name),
            field.span,
        ));
    };
    let ty = layout_field.ty.clone();
    let addr = sv.addr.offset_by(layout_field.offset)?;

    match sv.source {
        Source::Var(id) => {
            let node = ctx.linear.get(id, &field.name).ok_or_else(|| {
                CodegenError::Internal(format!("ownership node for `{}` has no field `{}`", sv.ty, field.name))
            })?;
            if ty.is_struct() {
                return Ok(Value::Struct(StructValue {
                    ty,
                    addr,
                    source: Source::Var(node),
                }));
            }
            // Reading a primitive field copies it; nothing is consumed.
            ctx.check_complete(node, span)?;
            addr.load(ty.val_type(), out);
            Ok(Value::Scalar(ty))
        }
        Source::Temp(slot) => {
            let value = if ty.is_struct() {
                let (copy, copy_addr) = ctx.alloc_struct(&ty)?;
                ctx.copy_struct(&ty, &addr, &copy_addr, out)?;
                Value::Struct(StructValue {
                    ty,
                    addr: copy_addr,
                    source: Source::Temp(copy),
                })
            } else {
                addr.load(ty.val_type(), out);
                Value::Scalar(ty)
            };
            ctx.release(&slot)?;
            Ok(value)
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Operators
// ══════════════════════════════════════════════════════════════════════════════

fn emit_binary(
    left: &Expr,
    op: BinOp,
    right: &Expr,
    expected: Option<&Ty>,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    if matches!(op, BinOp::And | BinOp::Or) {
        return emit_logical(left, op, right, ctx, out);
    }

    let hint = if op.is_comparison() {
        None
    } else {
        expected.filter(|t| t.is_numeric()).cloned()
    };
    let hint = hint
        .or_else(|| static_type(left, ctx))
        .or_else(|| static_type(right, ctx));

    let ty = match emit_expr(left, hint.as_ref(), ctx, out)? {
        Value::Scalar(ty) => ty,
        other => {
            return Err(ctx.error(
                ErrorCode::INVALID_OPERAND,
                format!("`{}` cannot be applied to {}", op.as_str(), describe(&other)),
                left.span,
            ))
        }
    };
    let rhs = emit_expr(right, Some(&ty), ctx, out)?;
    ctx.expect_scalar(&rhs, &ty, right.span)?;

    let (instr, result) = if op.is_comparison() {
        (comparison_op(op, &ty), Ty::Bool)
    } else {
        (arithmetic_op(op, &ty), ty.clone())
    };
    let Some(instr) = instr else {
        return Err(ctx.error(
            ErrorCode::INVALID_OPERAND,
            format!("`{}` cannot be applied to `{ty}`", op.as_str()),
            left.span.merge(right.span),
        ));
    };
    out.push(Instruction::Numeric(instr));
    Ok(Value::Scalar(result))
}

/// `and` / `or` short-circuit through a typed `if`.
fn emit_logical(
    left: &Expr,
    op: BinOp,
    right: &Expr,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let lhs = emit_expr(left, Some(&Ty::Bool), ctx, out)?;
    ctx.expect_scalar(&lhs, &Ty::Bool, left.span)?;

    let vars = ctx.struct_bindings();
    ctx.fork_vars(&vars, None);
    let mut rhs_code = Vec::new();
    let rhs = emit_expr(right, Some(&Ty::Bool), ctx, &mut rhs_code)?;
    ctx.expect_scalar(&rhs, &Ty::Bool, right.span)?;
    ctx.join_optional(&vars);

    let ty = BlockType::Value(ValType::I32);
    out.push(match op {
        BinOp::And => Instruction::If {
            ty,
            then: rhs_code,
            otherwise: vec![Instruction::I32Const(0)],
        },
        _ => Instruction::If {
            ty,
            then: vec![Instruction::I32Const(1)],
            otherwise: rhs_code,
        },
    });
    Ok(Value::Scalar(Ty::Bool))
}

fn emit_unary(
    op: UnaryOp,
    operand: &Expr,
    expected: Option<&Ty>,
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    match op {
        UnaryOp::Not => {
            let value = emit_expr(operand, Some(&Ty::Bool), ctx, out)?;
            ctx.expect_scalar(&value, &Ty::Bool, operand.span)?;
            out.push(Instruction::Numeric(NumericOp::I32Eqz));
            Ok(Value::Scalar(Ty::Bool))
        }
        UnaryOp::Neg => {
            // Folded so that the most negative integer literal fits.
            if let ExprKind::NumberLit(n) = &operand.kind {
                return emit_number(-n, expected, span, ctx, out);
            }
            let hint = expected
                .filter(|t| t.is_numeric())
                .cloned()
                .or_else(|| static_type(operand, ctx));
            let mut inner = Vec::new();
            let ty = match emit_expr(operand, hint.as_ref(), ctx, &mut inner)? {
                Value::Scalar(ty) if ty.is_numeric() => ty,
                other => {
                    return Err(ctx.error(
                        ErrorCode::INVALID_OPERAND,
                        format!("cannot negate {}", describe(&other)),
                        operand.span,
                    ))
                }
            };
            match ty {
                Ty::I32 => {
                    out.push(Instruction::I32Const(0));
                    out.extend(inner);
                    out.push(Instruction::Numeric(NumericOp::I32Sub));
                }
                Ty::I64 => {
                    out.push(Instruction::I64Const(0));
                    out.extend(inner);
                    out.push(Instruction::Numeric(NumericOp::I64Sub));
                }
                Ty::F32 => {
                    out.extend(inner);
                    out.push(Instruction::Numeric(NumericOp::F32Neg));
                }
                _ => {
                    out.extend(inner);
                    out.push(Instruction::Numeric(NumericOp::F64Neg));
                }
            }
            Ok(Value::Scalar(ty))
        }
    }
}

fn arithmetic_op(op: BinOp, ty: &Ty) -> Option<NumericOp> {
    use NumericOp as N;
    Some(match (op, ty) {
        (BinOp::Add, Ty::I32) => N::I32Add,
        (BinOp::Sub, Ty::I32) => N::I32Sub,
        (BinOp::Mul, Ty::I32) => N::I32Mul,
        (BinOp::Div, Ty::I32) => N::I32DivS,
        (BinOp::Mod, Ty::I32) => N::I32RemS,
        (BinOp::Add, Ty::I64) => N::I64Add,
        (BinOp::Sub, Ty::I64) => N::I64Sub,
        (BinOp::Mul, Ty::I64) => N::I64Mul,
        (BinOp::Div, Ty::I64) => N::I64DivS,
        (BinOp::Mod, Ty::I64) => N::I64RemS,
        (BinOp::Add, Ty::F32) => N::F32Add,
        (BinOp::Sub, Ty::F32) => N::F32Sub,
        (BinOp::Mul, Ty::F32) => N::F32Mul,
        (BinOp::Div, Ty::F32) => N::F32Div,
        (BinOp::Add, Ty::F64) => N::F64Add,
        (BinOp::Sub, Ty::F64) => N::F64Sub,
        (BinOp::Mul, Ty::F64) => N::F64Mul,
        (BinOp::Div, Ty::F64) => N::F64Div,
        _ => return None,
    })
}

fn comparison_op(op: BinOp, ty: &Ty) -> Option<NumericOp> {
    use NumericOp as N;
    Some(match (op, ty) {
        (BinOp::Eq, Ty::I32 | Ty::Bool) => N::I32Eq,
        (BinOp::NotEq, Ty::I32 | Ty::Bool) => N::I32Ne,
        (BinOp::Less, Ty::I32) => N::I32LtS,
        (BinOp::Greater, Ty::I32) => N::I32GtS,
        (BinOp::LessEq, Ty::I32) => N::I32LeS,
        (BinOp::GreaterEq, Ty::I32) => N::I32GeS,
        (BinOp::Eq, Ty::I64) => N::I64Eq,
        (BinOp::NotEq, Ty::I64) => N::I64Ne,
        (BinOp::Less, Ty::I64) => N::I64LtS,
        (BinOp::Greater, Ty::I64) => N::I64GtS,
        (BinOp::LessEq, Ty::I64) => N::I64LeS,
        (BinOp::GreaterEq, Ty::I64) => N::I64GeS,
        (BinOp::Eq, Ty::F32) => N::F32Eq,
        (BinOp::NotEq, Ty::F32) => N::F32Ne,
        (BinOp::Less, Ty::F32) => N::F32Lt,
        (BinOp::Greater, Ty::F32) => N::F32Gt,
        (BinOp::LessEq, Ty::F32) => N::F32Le,
        (BinOp::GreaterEq, Ty::F32) => N::F32Ge,
        (BinOp::Eq, Ty::F64) => N::F64Eq,
        (BinOp::NotEq, Ty::F64) => N::F64Ne,
        (BinOp::Less, Ty::F64) => N::F64Lt,
        (BinOp::Greater, Ty::F64) => N::F64Gt,
        (BinOp::LessEq, Ty::F64) => N::F64Le,
        (BinOp::GreaterEq, Ty::F64) => N::F64Ge,
        _ => return None,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Control Flow
// ══════════════════════════════════════════════════════════════════════════════

/// Compile an `if` expression.
///
/// Each arm runs under its own [`StackAllocator`](crate::stack::StackAllocator)
/// rewind of one checkpoint, and against a private copy of every structure
/// variable's ownership state. A structure result lives in one slot shared
/// by both arms: each arm's result allocation is aliased onto it.
fn emit_if(
    if_expr: &IfExpr,
    expected: Option<&Ty>,
    ctx: &mut FuncContext<'_, '_>,
    out: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let cond = emit_expr(&if_expr.condition, Some(&Ty::Bool), ctx, out)?;
    ctx.expect_scalar(&cond, &Ty::Bool, if_expr.condition.span)?;

    let has_else = if_expr.else_branch.is_some();
    let predicted = if has_else {
        expected.cloned().or_else(|| static_type_if(if_expr, ctx))
    } else {
        None
    };
    let mut slot = match &predicted {
        Some(ty) if ty.is_struct() => Some(ctx.alloc_struct(ty)?),
        _ => None,
    };

    let cp = ctx.stack.checkpoint()?;
    let vars = ctx.struct_bindings();

    // ── then ──
    ctx.fork_vars(&vars, None);
    let mut then_code = Vec::new();
    let mut then_val = emit_block(&if_expr.then_block, predicted.as_ref(), ctx, &mut then_code)?;
    if !has_else && !matches!(then_val, Value::Never) {
        ctx.discard(then_val, &mut then_code)?;
        then_val = Value::Unit;
    }
    let then_val = settle_arm(then_val, &mut slot, true, if_expr.then_block.span, ctx, &mut then_code)?;
    ctx.stack.rewind(cp)?;
    let then_state = ctx.current_states(&vars);

    // ── else ──
    ctx.fork_vars(&vars, None);
    let mut else_code = Vec::new();
    let else_val = match &if_expr.else_branch {
        Some(ElseBranch::Block(block)) => emit_block(block, predicted.as_ref(), ctx, &mut else_code)?,
        Some(ElseBranch::ElseIf(inner)) => emit_if(inner, predicted.as_ref(), ctx, &mut else_code)?,
        None => Value::Unit,
    };
    let else_val = settle_arm(else_val, &mut slot, false, if_expr.span, ctx, &mut else_code)?;
    ctx.stack.rewind(cp)?;
    ctx.stack.restore(cp)?;
    let else_state = ctx.current_states(&vars);

    // ── merge ──
    let then_never = matches!(then_val, Value::Never);
    let else_never = matches!(else_val, Value::Never);
    for (&(key, _), (t, e)) in vars.iter().zip(then_state.into_iter().zip(else_state)) {
        let merged = match (then_never, else_never) {
            (true, false) => e,
            (false, true) | (true, true) => t,
            (false, false) => {
                ctx.linear.infuse(t, e);
                t
            }
        };
        ctx.set_linear(key, merged);
    }

    let (value, ty) = match (then_val, else_val) {
        (Value::Never, Value::Never) => (Value::Never, BlockType::Empty),
        (Value::Never, v) | (v, Value::Never) => {
            let ty = block_type(&v);
            (v, ty)
        }
        (Value::Scalar(a), Value::Scalar(b)) if a == b => {
            let ty = BlockType::Value(a.val_type());
            (Value::Scalar(a), ty)
        }
        (Value::Struct(a), Value::Struct(b)) if a.ty == b.ty => (Value::Struct(a), BlockType::Empty),
        (Value::Unit, Value::Unit) => (Value::Unit, BlockType::Empty),
        (a, b) => {
            return Err(ctx.error(
                ErrorCode::TYPE_MISMATCH,
                format!(
                    "`if` and `else` have incompatible types: {} and {}",
                    describe(&a),
                    describe(&b)
                ),
                if_expr.span,
            ))
        }
    };
    if let (Some((unused, _)), false) = (&slot, matches!(value, Value::Struct(_))) {
        ctx.release(unused)?;
    }

    out.push(Instruction::If {
        ty,
        then: then_code,
        otherwise: else_code,
    });
    if let Value::Never = value {
        out.push(Instruction::Unreachable);
    }
    Ok(value)
}

/// Route a structure produced by one arm into the shared result slot.
///
/// Without a slot decided up front, the first arm's own allocation becomes
/// the slot: the checkpoint's first rewind promotes it to the enclosing
/// scope.
fn settle_arm(
    value: Value,
    slot: &mut Option<(StackAllocation, Address)>,
    first: bool,
    span: Span,
    ctx: &mut FuncContext<'_, '_>,
    code: &mut Vec<Instruction>,
) -> CodegenResult<Value> {
    let Value::Struct(sv) = value else {
        return Ok(value);
    };
    let sv = ctx.materialize(sv, span, code)?;
    let Source::Temp(temp) = &sv.source else {
        return Err(CodegenError::Internal("materialized value is not a temporary".into()));
    };
    if let Some((result, addr)) = slot.as_ref() {
        ctx.stack.make_alias(temp, result)?;
        return Ok(Value::Struct(StructValue {
            ty: sv.ty.clone(),
            addr: addr.clone(),
            source: Source::Temp(result.clone()),
        }));
    }
    if !first {
        return Err(ctx.error(
            ErrorCode::TYPE_MISMATCH,
            format!("`else` produces `{}` but the `if` has no structure result", sv.ty),
            span,
        ));
    }
    *slot = Some((temp.clone(), sv.addr.clone()));
    Ok(Value::Struct(sv))
}

fn block_type(value: &Value) -> BlockType {
    match value {
        Value::Scalar(ty) => BlockType::Value(ty.val_type()),
        _ => BlockType::Empty,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Static typing
// ══════════════════════════════════════════════════════════════════════════════

/// The type `expr` will have, when it can be told without compiling it.
/// Bare number literals have no type of their own.
pub fn static_type(expr: &Expr, ctx: &FuncContext<'_, '_>) -> Option<Ty> {
    match &expr.kind {
        ExprKind::NumberLit(_) => None,
        ExprKind::BoolLit(_) => Some(Ty::Bool),
        ExprKind::StructLit { name, .. } => ctx
            .layouts
            .get(&name.name)
            .map(|l| Ty::Struct(Rc::clone(&l.name))),
        ExprKind::Identifier(name) => match ctx.lookup(name)? {
            Binding::Scalar { ty, .. } => Some(ty.clone()),
            Binding::Struct(var) => Some(var.ty.clone()),
        },
        ExprKind::Call { name, .. } => ctx.compiler.signature(&name.name)?.ret.clone(),
        ExprKind::FieldAccess { object, field } => {
            let ty = static_type(object, ctx)?;
            let layout = ctx.layouts.get(ty.struct_name()?)?;
            layout.field(&field.name).map(|f| f.ty.clone())
        }
        ExprKind::Binary { left, op, right } => {
            if op.is_comparison() || matches!(op, BinOp::And | BinOp::Or) {
                Some(Ty::Bool)
            } else {
                static_type(left, ctx).or_else(|| static_type(right, ctx))
            }
        }
        ExprKind::Unary {
            op: UnaryOp::Not, ..
        } => Some(Ty::Bool),
        ExprKind::Unary { operand, .. } => static_type(operand, ctx),
        ExprKind::If(if_expr) => static_type_if(if_expr, ctx),
        ExprKind::Block(block) => static_type_block(block, ctx),
        ExprKind::Paren(inner) => static_type(inner, ctx),
    }
}

fn static_type_if(if_expr: &IfExpr, ctx: &FuncContext<'_, '_>) -> Option<Ty> {
    static_type_block(&if_expr.then_block, ctx).or_else(|| match &if_expr.else_branch {
        Some(ElseBranch::Block(block)) => static_type_block(block, ctx),
        Some(ElseBranch::ElseIf(inner)) => static_type_if(inner, ctx),
        None => None,
    })
}

fn static_type_block(block: &Block, ctx: &FuncContext<'_, '_>) -> Option<Ty> {
    let tail = block.tail.as_deref()?;
    // A tail naming a local of the block itself.
    if let ExprKind::Identifier(name) = &tail.kind {
        let local = block.stmts.iter().rev().find_map(|stmt| match stmt {
            Stmt::Let(binding) if binding.name.name == *name => Some(binding),
            _ => None,
        });
        if let Some(binding) = local {
            return match (&binding.type_ann, &binding.value) {
                (Some(ann), _) => ctx.layouts.resolve(ann, ctx.compiler.file()).ok(),
                (None, Some(value)) => static_type(value, ctx),
                (None, None) => None,
            };
        }
    }
    static_type(tail, ctx)
}
