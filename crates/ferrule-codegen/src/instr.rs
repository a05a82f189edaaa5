//! Instruction objects and their binary encoding.
//!
//! Function bodies are built as trees of [`Instruction`]s. Structured control
//! flow carries its children and writes its own `else`/`end` delimiters, so
//! branch targets are nesting depths rather than byte addresses. Immediates
//! that are not known while the body is built (function, local and global
//! indices, stack offsets, the frame size) are [`Latent`] cells read here.

use crate::binary::{write_f32, write_f64, write_i32, write_i64, write_u32};
use crate::error::{CodegenError, CodegenResult};
use crate::latent::Latent;
use crate::module::{FuncRef, GlobalRef};
use crate::register::LocalRef;
use crate::types::{BlockType, ValType};

/// A byte offset that may depend on a not-yet-resolved stack slot.
#[derive(Debug, Clone)]
pub struct Offset {
    base: Option<Latent<u32>>,
    addend: u32,
}

impl Offset {
    pub fn fixed(addend: u32) -> Self {
        Self { base: None, addend }
    }

    pub fn latent(base: Latent<u32>) -> Self {
        Self {
            base: Some(base),
            addend: 0,
        }
    }

    /// The same offset moved `bytes` further.
    pub fn plus(&self, bytes: u32) -> CodegenResult<Self> {
        let addend = self
            .addend
            .checked_add(bytes)
            .ok_or_else(|| CodegenError::LimitExceeded("memory offset".into()))?;
        Ok(Self {
            base: self.base.clone(),
            addend,
        })
    }

    pub fn value(&self) -> CodegenResult<u32> {
        let base = match &self.base {
            Some(base) => base.get()?,
            None => 0,
        };
        base.checked_add(self.addend)
            .ok_or_else(|| CodegenError::LimitExceeded("memory offset".into()))
    }
}

/// Memory immediate: log2 alignment and a static offset.
#[derive(Debug, Clone)]
pub struct MemArg {
    pub align: u32,
    pub offset: Offset,
}

impl MemArg {
    /// Natural alignment for `ty` at `offset`.
    pub fn natural(ty: ValType, offset: Offset) -> Self {
        Self {
            align: ty.size().trailing_zeros(),
            offset,
        }
    }
}

/// Numeric instructions (no immediates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    // ── i32 ──
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I32LeS,
    I32GeS,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32RemS,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    // ── i64 ──
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64GtS,
    I64LeS,
    I64GeS,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64RemS,
    I64And,
    I64Or,
    I64Xor,
    // ── f32 ──
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F32Neg,
    F32Sqrt,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    // ── f64 ──
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    F64Neg,
    F64Sqrt,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    // ── conversions ──
    I32WrapI64,
    I32TruncF32S,
    I32TruncF64S,
    I64ExtendI32S,
    I64TruncF32S,
    I64TruncF64S,
    F32ConvertI32S,
    F32ConvertI64S,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI64S,
    F64PromoteF32,
}

impl NumericOp {
    pub fn opcode(self) -> u8 {
        use NumericOp::*;
        match self {
            I32Eqz => 0x45,
            I32Eq => 0x46,
            I32Ne => 0x47,
            I32LtS => 0x48,
            I32GtS => 0x4A,
            I32LeS => 0x4C,
            I32GeS => 0x4E,
            I64Eqz => 0x50,
            I64Eq => 0x51,
            I64Ne => 0x52,
            I64LtS => 0x53,
            I64GtS => 0x55,
            I64LeS => 0x57,
            I64GeS => 0x59,
            F32Eq => 0x5B,
            F32Ne => 0x5C,
            F32Lt => 0x5D,
            F32Gt => 0x5E,
            F32Le => 0x5F,
            F32Ge => 0x60,
            F64Eq => 0x61,
            F64Ne => 0x62,
            F64Lt => 0x63,
            F64Gt => 0x64,
            F64Le => 0x65,
            F64Ge => 0x66,
            I32Add => 0x6A,
            I32Sub => 0x6B,
            I32Mul => 0x6C,
            I32DivS => 0x6D,
            I32RemS => 0x6F,
            I32And => 0x71,
            I32Or => 0x72,
            I32Xor => 0x73,
            I32Shl => 0x74,
            I32ShrS => 0x75,
            I64Add => 0x7C,
            I64Sub => 0x7D,
            I64Mul => 0x7E,
            I64DivS => 0x7F,
            I64RemS => 0x81,
            I64And => 0x83,
            I64Or => 0x84,
            I64Xor => 0x85,
            F32Neg => 0x8C,
            F32Sqrt => 0x91,
            F32Add => 0x92,
            F32Sub => 0x93,
            F32Mul => 0x94,
            F32Div => 0x95,
            F64Neg => 0x9A,
            F64Sqrt => 0x9F,
            F64Add => 0xA0,
            F64Sub => 0xA1,
            F64Mul => 0xA2,
            F64Div => 0xA3,
            I32WrapI64 => 0xA7,
            I32TruncF32S => 0xA8,
            I32TruncF64S => 0xAA,
            I64ExtendI32S => 0xAC,
            I64TruncF32S => 0xAE,
            I64TruncF64S => 0xB0,
            F32ConvertI32S => 0xB2,
            F32ConvertI64S => 0xB4,
            F32DemoteF64 => 0xB6,
            F64ConvertI32S => 0xB7,
            F64ConvertI64S => 0xB9,
            F64PromoteF32 => 0xBB,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    // ── Control ──────────────────────────────────────────────────────────
    Block(BlockType, Vec<Instruction>),
    Loop(BlockType, Vec<Instruction>),
    If {
        ty: BlockType,
        then: Vec<Instruction>,
        otherwise: Vec<Instruction>,
    },
    Br(u32),
    BrIf(u32),
    Return,
    Unreachable,
    Nop,
    Drop,
    Select,

    // ── Numeric ──────────────────────────────────────────────────────────
    Numeric(NumericOp),

    // ── Memory ───────────────────────────────────────────────────────────
    Load(ValType, MemArg),
    Store(ValType, MemArg),

    // ── Variables ────────────────────────────────────────────────────────
    LocalGet(LocalRef),
    LocalSet(LocalRef),
    LocalTee(LocalRef),
    GlobalGet(GlobalRef),
    GlobalSet(GlobalRef),

    // ── Constants ────────────────────────────────────────────────────────
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// An `i32.const` whose value is only known after layout.
    I32ConstLatent(Offset),

    // ── Calls ────────────────────────────────────────────────────────────
    Call(FuncRef),
}

impl Instruction {
    pub fn encode(&self, buf: &mut Vec<u8>) -> CodegenResult<()> {
        match self {
            Instruction::Block(ty, body) => {
                buf.push(0x02);
                buf.push(ty.to_byte());
                encode_all(body, buf)?;
                buf.push(0x0B);
            }
            Instruction::Loop(ty, body) => {
                buf.push(0x03);
                buf.push(ty.to_byte());
                encode_all(body, buf)?;
                buf.push(0x0B);
            }
            Instruction::If {
                ty,
                then,
                otherwise,
            } => {
                buf.push(0x04);
                buf.push(ty.to_byte());
                encode_all(then, buf)?;
                if !otherwise.is_empty() || *ty != BlockType::Empty {
                    buf.push(0x05);
                    encode_all(otherwise, buf)?;
                }
                buf.push(0x0B);
            }
            Instruction::Br(depth) => {
                buf.push(0x0C);
                write_u32(buf, *depth);
            }
            Instruction::BrIf(depth) => {
                buf.push(0x0D);
                write_u32(buf, *depth);
            }
            Instruction::Return => buf.push(0x0F),
            Instruction::Unreachable => buf.push(0x00),
            Instruction::Nop => buf.push(0x01),
            Instruction::Drop => buf.push(0x1A),
            Instruction::Select => buf.push(0x1B),

            Instruction::Numeric(op) => buf.push(op.opcode()),

            Instruction::Load(ty, arg) => {
                buf.push(match ty {
                    ValType::I32 => 0x28,
                    ValType::I64 => 0x29,
                    ValType::F32 => 0x2A,
                    ValType::F64 => 0x2B,
                });
                encode_memarg(arg, buf)?;
            }
            Instruction::Store(ty, arg) => {
                buf.push(match ty {
                    ValType::I32 => 0x36,
                    ValType::I64 => 0x37,
                    ValType::F32 => 0x38,
                    ValType::F64 => 0x39,
                });
                encode_memarg(arg, buf)?;
            }

            Instruction::LocalGet(local) => {
                buf.push(0x20);
                write_u32(buf, local.index().get()?);
            }
            Instruction::LocalSet(local) => {
                buf.push(0x21);
                write_u32(buf, local.index().get()?);
            }
            Instruction::LocalTee(local) => {
                buf.push(0x22);
                write_u32(buf, local.index().get()?);
            }
            Instruction::GlobalGet(global) => {
                buf.push(0x23);
                write_u32(buf, global.index().get()?);
            }
            Instruction::GlobalSet(global) => {
                buf.push(0x24);
                write_u32(buf, global.index().get()?);
            }

            Instruction::I32Const(value) => {
                buf.push(0x41);
                write_i32(buf, *value);
            }
            Instruction::I64Const(value) => {
                buf.push(0x42);
                write_i64(buf, *value);
            }
            Instruction::F32Const(value) => {
                buf.push(0x43);
                write_f32(buf, *value);
            }
            Instruction::F64Const(value) => {
                buf.push(0x44);
                write_f64(buf, *value);
            }
            Instruction::I32ConstLatent(offset) => {
                let value = offset.value()?;
                let value = i32::try_from(value).map_err(|_| {
                    CodegenError::LimitExceeded(format!("constant {value} does not fit i32"))
                })?;
                buf.push(0x41);
                write_i32(buf, value);
            }

            Instruction::Call(func) => {
                buf.push(0x10);
                write_u32(buf, func.index().get()?);
            }
        }
        Ok(())
    }
}

pub fn encode_all(instrs: &[Instruction], buf: &mut Vec<u8>) -> CodegenResult<()> {
    for instr in instrs {
        instr.encode(buf)?;
    }
    Ok(())
}

fn encode_memarg(arg: &MemArg, buf: &mut Vec<u8>) -> CodegenResult<()> {
    write_u32(buf, arg.align);
    write_u32(buf, arg.offset.value()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::LatentError;
    use crate::register::RegisterAllocator;

    fn bytes(instrs: &[Instruction]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_all(instrs, &mut buf).unwrap();
        buf
    }

    #[test]
    fn constants() {
        assert_eq!(bytes(&[Instruction::I32Const(-1)]), vec![0x41, 0x7F]);
        assert_eq!(bytes(&[Instruction::I64Const(128)]), vec![0x42, 0x80, 0x01]);
        assert_eq!(
            bytes(&[Instruction::F32Const(1.0)]),
            vec![0x43, 0x00, 0x00, 0x80, 0x3F]
        );
        assert_eq!(
            bytes(&[Instruction::F64Const(2.0)]),
            vec![0x44, 0, 0, 0, 0, 0, 0, 0, 0x40]
        );
    }

    #[test]
    fn structured_control_writes_delimiters() {
        let code = bytes(&[Instruction::Block(
            BlockType::Empty,
            vec![Instruction::Loop(
                BlockType::Empty,
                vec![Instruction::BrIf(1), Instruction::Br(0)],
            )],
        )]);
        assert_eq!(
            code,
            vec![0x02, 0x40, 0x03, 0x40, 0x0D, 0x01, 0x0C, 0x00, 0x0B, 0x0B]
        );
    }

    #[test]
    fn typed_if_always_has_else() {
        let code = bytes(&[Instruction::If {
            ty: BlockType::Value(ValType::I32),
            then: vec![Instruction::I32Const(1)],
            otherwise: vec![Instruction::I32Const(2)],
        }]);
        assert_eq!(code, vec![0x04, 0x7F, 0x41, 0x01, 0x05, 0x41, 0x02, 0x0B]);

        let untyped = bytes(&[Instruction::If {
            ty: BlockType::Empty,
            then: vec![Instruction::Nop],
            otherwise: vec![],
        }]);
        assert_eq!(untyped, vec![0x04, 0x40, 0x01, 0x0B]);
    }

    #[test]
    fn memory_access_reads_latent_offset() {
        let slot: Latent<u32> = Latent::new("stack offset");
        let load = Instruction::Load(
            ValType::F64,
            MemArg::natural(ValType::F64, Offset::latent(slot.clone()).plus(8).unwrap()),
        );
        let mut buf = Vec::new();
        assert!(matches!(
            load.encode(&mut buf),
            Err(CodegenError::Latent(LatentError::Unresolved("stack offset")))
        ));
        slot.resolve(16).unwrap();
        assert_eq!(bytes(&[load]), vec![0x2B, 0x03, 0x18]);
    }

    #[test]
    fn locals_encode_after_finish() {
        let mut regs = RegisterAllocator::new(&[ValType::I32]);
        let tmp = regs.allocate(ValType::I64).unwrap();
        let set = Instruction::LocalSet(tmp);
        let mut buf = Vec::new();
        assert!(set.encode(&mut buf).is_err());
        regs.finish().unwrap();
        assert_eq!(bytes(&[set]), vec![0x21, 0x01]);
    }

    #[test]
    fn latent_constant_must_fit_i32() {
        let size: Latent<u32> = Latent::new("frame size");
        size.resolve(u32::MAX).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            Instruction::I32ConstLatent(Offset::latent(size)).encode(&mut buf),
            Err(CodegenError::LimitExceeded(_))
        ));
    }

    #[test]
    fn numeric_opcodes() {
        assert_eq!(
            bytes(&[
                Instruction::Numeric(NumericOp::I32Add),
                Instruction::Numeric(NumericOp::I64LtS),
                Instruction::Numeric(NumericOp::F64Div),
                Instruction::Numeric(NumericOp::I32WrapI64),
            ]),
            vec![0x6A, 0x53, 0xA3, 0xA7]
        );
    }
}
