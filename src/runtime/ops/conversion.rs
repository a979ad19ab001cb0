//! Float to integer truncation
//!
//! NaN traps with `InvalidConversionToInteger`. Anything whose truncation lies
//! outside the target range, infinities included, traps with `IntegerOverflow`.
//! The bounds are exclusive and exactly representable in the source type.

use crate::runtime::trap::TrapKind;

macro_rules! trunc {
    ($name:ident, $from:ty, $to:ty, $lower:expr, $upper:expr) => {
        pub fn $name(value: $from) -> Result<$to, TrapKind> {
            if value.is_nan() {
                return Err(TrapKind::InvalidConversionToInteger);
            }
            let truncated = value.trunc();
            if truncated <= $lower || truncated >= $upper {
                return Err(TrapKind::IntegerOverflow);
            }
            Ok(truncated as $to)
        }
    };
}

trunc!(i32_trunc_f32_s, f32, i32, -2147483904.0f32, 2147483648.0f32);
trunc!(i32_trunc_f32_u, f32, u32, -1.0f32, 4294967296.0f32);
trunc!(i32_trunc_f64_s, f64, i32, -2147483649.0f64, 2147483648.0f64);
trunc!(i32_trunc_f64_u, f64, u32, -1.0f64, 4294967296.0f64);
trunc!(i64_trunc_f32_s, f32, i64, -9223373136366403584.0f32, 9223372036854775808.0f32);
trunc!(i64_trunc_f32_u, f32, u64, -1.0f32, 18446744073709551616.0f32);
trunc!(i64_trunc_f64_s, f64, i64, -9223372036854777856.0f64, 9223372036854775808.0f64);
trunc!(i64_trunc_f64_u, f64, u64, -1.0f64, 18446744073709551616.0f64);
