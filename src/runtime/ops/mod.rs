//! Evaluation of numeric instructions
//!
//! This is the single definition of arithmetic, comparison and conversion
//! semantics. The interpreter calls [`eval`] directly and the native code
//! generator calls it through a helper for everything it does not emit
//! inline, so both engines produce bit-identical results.

pub mod conversion;
pub mod float;
pub mod integer;

use crate::ir::NumericOp;
use crate::module::opcode::*;
use crate::runtime::trap::TrapKind;
use crate::runtime::Value;

/// Apply `op` to its operands, bottom of stack first
pub fn eval(op: NumericOp, operands: &[Value]) -> Result<Value, TrapKind> {
    let opcode = op.opcode();
    match *operands {
        [Value::I32(a)] => unary_i32(opcode, a),
        [Value::I64(a)] => unary_i64(opcode, a),
        [Value::F32(a)] => unary_f32(opcode, a),
        [Value::F64(a)] => unary_f64(opcode, a),
        [Value::I32(a), Value::I32(b)] => binary_i32(opcode, a, b),
        [Value::I64(a), Value::I64(b)] => binary_i64(opcode, a, b),
        [Value::F32(a), Value::F32(b)] => Ok(binary_f32(opcode, a, b)),
        [Value::F64(a), Value::F64(b)] => Ok(binary_f64(opcode, a, b)),
        _ => unreachable!("operands {operands:?} do not fit {op:?}"),
    }
}

fn bool_value(b: bool) -> Value {
    Value::I32(b as i32)
}

fn unary_i32(opcode: u8, a: i32) -> Result<Value, TrapKind> {
    Ok(match opcode {
        I32_EQZ => bool_value(a == 0),
        I32_CLZ => Value::I32(a.leading_zeros() as i32),
        I32_CTZ => Value::I32(a.trailing_zeros() as i32),
        I32_POPCNT => Value::I32(a.count_ones() as i32),
        I64_EXTEND_I32_S => Value::I64(a as i64),
        I64_EXTEND_I32_U => Value::I64(a as u32 as i64),
        F32_CONVERT_I32_S => Value::F32(a as f32),
        F32_CONVERT_I32_U => Value::F32(a as u32 as f32),
        F64_CONVERT_I32_S => Value::F64(a as f64),
        F64_CONVERT_I32_U => Value::F64(a as u32 as f64),
        F32_REINTERPRET_I32 => Value::F32(f32::from_bits(a as u32)),
        _ => unreachable!("0x{opcode:02x} is not a unary i32 operation"),
    })
}

fn unary_i64(opcode: u8, a: i64) -> Result<Value, TrapKind> {
    Ok(match opcode {
        I64_EQZ => bool_value(a == 0),
        I64_CLZ => Value::I64(a.leading_zeros() as i64),
        I64_CTZ => Value::I64(a.trailing_zeros() as i64),
        I64_POPCNT => Value::I64(a.count_ones() as i64),
        I32_WRAP_I64 => Value::I32(a as i32),
        F32_CONVERT_I64_S => Value::F32(a as f32),
        F32_CONVERT_I64_U => Value::F32(a as u64 as f32),
        F64_CONVERT_I64_S => Value::F64(a as f64),
        F64_CONVERT_I64_U => Value::F64(a as u64 as f64),
        F64_REINTERPRET_I64 => Value::F64(f64::from_bits(a as u64)),
        _ => unreachable!("0x{opcode:02x} is not a unary i64 operation"),
    })
}

fn unary_f32(opcode: u8, a: f32) -> Result<Value, TrapKind> {
    Ok(match opcode {
        F32_ABS => Value::F32(f32::from_bits(a.to_bits() & 0x7fff_ffff)),
        F32_NEG => Value::F32(f32::from_bits(a.to_bits() ^ 0x8000_0000)),
        F32_CEIL => Value::F32(a.ceil()),
        F32_FLOOR => Value::F32(a.floor()),
        F32_TRUNC => Value::F32(a.trunc()),
        F32_NEAREST => Value::F32(float::f32_nearest(a)),
        F32_SQRT => Value::F32(a.sqrt()),
        I32_TRUNC_F32_S => Value::I32(conversion::i32_trunc_f32_s(a)?),
        I32_TRUNC_F32_U => Value::I32(conversion::i32_trunc_f32_u(a)? as i32),
        I64_TRUNC_F32_S => Value::I64(conversion::i64_trunc_f32_s(a)?),
        I64_TRUNC_F32_U => Value::I64(conversion::i64_trunc_f32_u(a)? as i64),
        F64_PROMOTE_F32 => Value::F64(a as f64),
        I32_REINTERPRET_F32 => Value::I32(a.to_bits() as i32),
        _ => unreachable!("0x{opcode:02x} is not a unary f32 operation"),
    })
}

fn unary_f64(opcode: u8, a: f64) -> Result<Value, TrapKind> {
    Ok(match opcode {
        F64_ABS => Value::F64(f64::from_bits(a.to_bits() & 0x7fff_ffff_ffff_ffff)),
        F64_NEG => Value::F64(f64::from_bits(a.to_bits() ^ 0x8000_0000_0000_0000)),
        F64_CEIL => Value::F64(a.ceil()),
        F64_FLOOR => Value::F64(a.floor()),
        F64_TRUNC => Value::F64(a.trunc()),
        F64_NEAREST => Value::F64(float::f64_nearest(a)),
        F64_SQRT => Value::F64(a.sqrt()),
        I32_TRUNC_F64_S => Value::I32(conversion::i32_trunc_f64_s(a)?),
        I32_TRUNC_F64_U => Value::I32(conversion::i32_trunc_f64_u(a)? as i32),
        I64_TRUNC_F64_S => Value::I64(conversion::i64_trunc_f64_s(a)?),
        I64_TRUNC_F64_U => Value::I64(conversion::i64_trunc_f64_u(a)? as i64),
        F32_DEMOTE_F64 => Value::F32(a as f32),
        I64_REINTERPRET_F64 => Value::I64(a.to_bits() as i64),
        _ => unreachable!("0x{opcode:02x} is not a unary f64 operation"),
    })
}

fn binary_i32(opcode: u8, a: i32, b: i32) -> Result<Value, TrapKind> {
    let (ua, ub) = (a as u32, b as u32);
    Ok(match opcode {
        I32_EQ => bool_value(a == b),
        I32_NE => bool_value(a != b),
        I32_LT_S => bool_value(a < b),
        I32_LT_U => bool_value(ua < ub),
        I32_GT_S => bool_value(a > b),
        I32_GT_U => bool_value(ua > ub),
        I32_LE_S => bool_value(a <= b),
        I32_LE_U => bool_value(ua <= ub),
        I32_GE_S => bool_value(a >= b),
        I32_GE_U => bool_value(ua >= ub),
        I32_ADD => Value::I32(a.wrapping_add(b)),
        I32_SUB => Value::I32(a.wrapping_sub(b)),
        I32_MUL => Value::I32(a.wrapping_mul(b)),
        I32_DIV_S => Value::I32(integer::i32_div_s(a, b)?),
        I32_DIV_U => Value::I32(integer::i32_div_u(a, b)?),
        I32_REM_S => Value::I32(integer::i32_rem_s(a, b)?),
        I32_REM_U => Value::I32(integer::i32_rem_u(a, b)?),
        I32_AND => Value::I32(a & b),
        I32_OR => Value::I32(a | b),
        I32_XOR => Value::I32(a ^ b),
        I32_SHL => Value::I32(a.wrapping_shl(ub)),
        I32_SHR_S => Value::I32(a.wrapping_shr(ub)),
        I32_SHR_U => Value::I32(ua.wrapping_shr(ub) as i32),
        I32_ROTL => Value::I32(a.rotate_left(ub % 32)),
        I32_ROTR => Value::I32(a.rotate_right(ub % 32)),
        _ => unreachable!("0x{opcode:02x} is not a binary i32 operation"),
    })
}

fn binary_i64(opcode: u8, a: i64, b: i64) -> Result<Value, TrapKind> {
    let (ua, ub) = (a as u64, b as u64);
    let shift = (ub % 64) as u32;
    Ok(match opcode {
        I64_EQ => bool_value(a == b),
        I64_NE => bool_value(a != b),
        I64_LT_S => bool_value(a < b),
        I64_LT_U => bool_value(ua < ub),
        I64_GT_S => bool_value(a > b),
        I64_GT_U => bool_value(ua > ub),
        I64_LE_S => bool_value(a <= b),
        I64_LE_U => bool_value(ua <= ub),
        I64_GE_S => bool_value(a >= b),
        I64_GE_U => bool_value(ua >= ub),
        I64_ADD => Value::I64(a.wrapping_add(b)),
        I64_SUB => Value::I64(a.wrapping_sub(b)),
        I64_MUL => Value::I64(a.wrapping_mul(b)),
        I64_DIV_S => Value::I64(integer::i64_div_s(a, b)?),
        I64_DIV_U => Value::I64(integer::i64_div_u(a, b)?),
        I64_REM_S => Value::I64(integer::i64_rem_s(a, b)?),
        I64_REM_U => Value::I64(integer::i64_rem_u(a, b)?),
        I64_AND => Value::I64(a & b),
        I64_OR => Value::I64(a | b),
        I64_XOR => Value::I64(a ^ b),
        I64_SHL => Value::I64(a.wrapping_shl(shift)),
        I64_SHR_S => Value::I64(a.wrapping_shr(shift)),
        I64_SHR_U => Value::I64(ua.wrapping_shr(shift) as i64),
        I64_ROTL => Value::I64(a.rotate_left(shift)),
        I64_ROTR => Value::I64(a.rotate_right(shift)),
        _ => unreachable!("0x{opcode:02x} is not a binary i64 operation"),
    })
}

fn binary_f32(opcode: u8, a: f32, b: f32) -> Value {
    match opcode {
        F32_EQ => bool_value(a == b),
        F32_NE => bool_value(a != b),
        F32_LT => bool_value(a < b),
        F32_GT => bool_value(a > b),
        F32_LE => bool_value(a <= b),
        F32_GE => bool_value(a >= b),
        F32_ADD => Value::F32(a + b),
        F32_SUB => Value::F32(a - b),
        F32_MUL => Value::F32(a * b),
        F32_DIV => Value::F32(a / b),
        F32_MIN => Value::F32(float::f32_min(a, b)),
        F32_MAX => Value::F32(float::f32_max(a, b)),
        F32_COPYSIGN => Value::F32(f32::from_bits((a.to_bits() & 0x7fff_ffff) | (b.to_bits() & 0x8000_0000))),
        _ => unreachable!("0x{opcode:02x} is not a binary f32 operation"),
    }
}

fn binary_f64(opcode: u8, a: f64, b: f64) -> Value {
    const SIGN: u64 = 0x8000_0000_0000_0000;
    match opcode {
        F64_EQ => bool_value(a == b),
        F64_NE => bool_value(a != b),
        F64_LT => bool_value(a < b),
        F64_GT => bool_value(a > b),
        F64_LE => bool_value(a <= b),
        F64_GE => bool_value(a >= b),
        F64_ADD => Value::F64(a + b),
        F64_SUB => Value::F64(a - b),
        F64_MUL => Value::F64(a * b),
        F64_DIV => Value::F64(a / b),
        F64_MIN => Value::F64(float::f64_min(a, b)),
        F64_MAX => Value::F64(float::f64_max(a, b)),
        F64_COPYSIGN => Value::F64(f64::from_bits((a.to_bits() & !SIGN) | (b.to_bits() & SIGN))),
        _ => unreachable!("0x{opcode:02x} is not a binary f64 operation"),
    }
}
