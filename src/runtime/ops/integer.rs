//! Integer operations that can trap
//!
//! Everything else on integers maps directly onto a wrapping Rust operator and
//! lives inline in the dispatcher.

use crate::runtime::trap::TrapKind;

/// i32.div_s
/// Traps on a zero divisor, and on `i32::MIN / -1` whose result does not fit
pub fn i32_div_s(c1: i32, c2: i32) -> Result<i32, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    if c1 == i32::MIN && c2 == -1 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(c1 / c2)
}

/// i32.div_u
pub fn i32_div_u(c1: i32, c2: i32) -> Result<i32, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(((c1 as u32) / (c2 as u32)) as i32)
}

/// i32.rem_s
/// The sign of the result follows the dividend. `i32::MIN % -1` is 0, not a trap.
pub fn i32_rem_s(c1: i32, c2: i32) -> Result<i32, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(c1.wrapping_rem(c2))
}

/// i32.rem_u
pub fn i32_rem_u(c1: i32, c2: i32) -> Result<i32, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(((c1 as u32) % (c2 as u32)) as i32)
}

/// i64.div_s
pub fn i64_div_s(c1: i64, c2: i64) -> Result<i64, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    if c1 == i64::MIN && c2 == -1 {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(c1 / c2)
}

/// i64.div_u
pub fn i64_div_u(c1: i64, c2: i64) -> Result<i64, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(((c1 as u64) / (c2 as u64)) as i64)
}

/// i64.rem_s
pub fn i64_rem_s(c1: i64, c2: i64) -> Result<i64, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(c1.wrapping_rem(c2))
}

/// i64.rem_u
pub fn i64_rem_u(c1: i64, c2: i64) -> Result<i64, TrapKind> {
    if c2 == 0 {
        return Err(TrapKind::IntegerDivideByZero);
    }
    Ok(((c1 as u64) % (c2 as u64)) as i64)
}
