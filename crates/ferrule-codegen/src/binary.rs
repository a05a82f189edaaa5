//! Binary primitives: LEB128 integer codecs and IEEE-754 float codecs.
//!
//! Unsigned values (indices, sizes, counts) use unsigned LEB128: seven data
//! bits per byte, high bit set while more bytes follow. Signed constants use
//! the two's-complement variant, which stops as soon as the remaining value
//! is fully described by the sign bit (`0x40`) of the last group. Floats are
//! raw little-endian bit patterns.

use thiserror::Error;

use crate::error::{ensure_u32, CodegenResult};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    /// A fractional (or non-finite) number was given to an integer encoder.
    #[error("{0} is not an integer")]
    NonInteger(f64),

    /// The value does not fit the target integer width.
    #[error("{value} is out of range for {target}")]
    OutOfRange { value: f64, target: &'static str },

    /// Input ended in the middle of an encoded value.
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    /// An encoded integer used more bytes than its width allows.
    #[error("integer encoding too long at byte {offset}")]
    Overlong { offset: usize },
}

// ══════════════════════════════════════════════════════════════════════════════
// Encoding
// ══════════════════════════════════════════════════════════════════════════════

pub fn write_unsigned(buf: &mut Vec<u8>, value: u64) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

pub fn write_signed(buf: &mut Vec<u8>, value: i64) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        // Arithmetic shift keeps the sign of what remains.
        val >>= 7;
        let sign_bit_clear = byte & 0x40 == 0;
        let done = (val == 0 && sign_bit_clear) || (val == -1 && !sign_bit_clear);
        if !done {
            byte |= 0x80;
        }
        buf.push(byte);
        if done {
            break;
        }
    }
}

pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    write_unsigned(buf, u64::from(value));
}

pub fn write_i32(buf: &mut Vec<u8>, value: i32) {
    write_signed(buf, i64::from(value));
}

pub fn write_i64(buf: &mut Vec<u8>, value: i64) {
    write_signed(buf, value);
}

pub fn write_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
}

pub fn write_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
}

/// Length-prefixed UTF-8 name, as used by imports, exports and custom
/// sections.
pub fn write_name(buf: &mut Vec<u8>, name: &str) -> CodegenResult<()> {
    write_u32(buf, ensure_u32(name.len(), "name length")?);
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

/// Length-prefixed byte vector.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CodegenResult<()> {
    write_u32(buf, ensure_u32(bytes.len(), "byte vector length")?);
    buf.extend_from_slice(bytes);
    Ok(())
}

// ── Checked numeric conversions ──────────────────────────────────────────────

/// Convert a source-level number to an integer, rejecting fractions,
/// non-finite values and anything outside `i64`.
pub fn integer_from_f64(value: f64) -> Result<i64, EncodeError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(EncodeError::NonInteger(value));
    }
    // 2^63 is exactly representable; anything at or above it overflows.
    if value < -9_223_372_036_854_775_808.0 || value >= 9_223_372_036_854_775_808.0 {
        return Err(EncodeError::OutOfRange {
            value,
            target: "i64",
        });
    }
    Ok(value as i64)
}

pub fn i32_from_f64(value: f64) -> Result<i32, EncodeError> {
    let int = integer_from_f64(value)?;
    i32::try_from(int).map_err(|_| EncodeError::OutOfRange {
        value,
        target: "i32",
    })
}

/// Narrow a source-level number to `f32`. Rounding is fine; overflowing to
/// infinity is not.
pub fn f32_from_f64(value: f64) -> Result<f32, EncodeError> {
    let narrowed = value as f32;
    if value.is_finite() && !narrowed.is_finite() {
        return Err(EncodeError::OutOfRange {
            value,
            target: "f32",
        });
    }
    Ok(narrowed)
}

/// Unsigned LEB128 of a source-level number.
pub fn write_unsigned_number(buf: &mut Vec<u8>, value: f64) -> Result<(), EncodeError> {
    let int = integer_from_f64(value)?;
    let unsigned = u64::try_from(int).map_err(|_| EncodeError::OutOfRange {
        value,
        target: "u64",
    })?;
    write_unsigned(buf, unsigned);
    Ok(())
}

/// Signed LEB128 of a source-level number.
pub fn write_signed_number(buf: &mut Vec<u8>, value: f64) -> Result<(), EncodeError> {
    write_signed(buf, integer_from_f64(value)?);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Decoding
// ══════════════════════════════════════════════════════════════════════════════

/// Decode an unsigned LEB128 value starting at `*pos`, advancing `*pos`.
pub fn read_unsigned(bytes: &[u8], pos: &mut usize) -> Result<u64, EncodeError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or(EncodeError::UnexpectedEof { offset: *pos })?;
        if shift >= 64 || (shift == 63 && byte & 0x7E != 0) {
            return Err(EncodeError::Overlong { offset: *pos });
        }
        *pos += 1;
        result |= u64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
}

/// Decode a signed LEB128 value starting at `*pos`, advancing `*pos`.
pub fn read_signed(bytes: &[u8], pos: &mut usize) -> Result<i64, EncodeError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or(EncodeError::UnexpectedEof { offset: *pos })?;
        if shift >= 64 {
            return Err(EncodeError::Overlong { offset: *pos });
        }
        *pos += 1;
        result |= i64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
}

pub fn read_f32(bytes: &[u8], pos: &mut usize) -> Result<f32, EncodeError> {
    let raw: [u8; 4] = bytes
        .get(*pos..*pos + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(EncodeError::UnexpectedEof { offset: *pos })?;
    *pos += 4;
    Ok(f32::from_bits(u32::from_le_bytes(raw)))
}

pub fn read_f64(bytes: &[u8], pos: &mut usize) -> Result<f64, EncodeError> {
    let raw: [u8; 8] = bytes
        .get(*pos..*pos + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(EncodeError::UnexpectedEof { offset: *pos })?;
    *pos += 8;
    Ok(f64::from_bits(u64::from_le_bytes(raw)))
}
