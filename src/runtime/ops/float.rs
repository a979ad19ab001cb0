//! Floating-point operations whose semantics differ from the Rust operators
//!
//! `min`/`max` propagate NaN and order -0.0 below +0.0, where `f32::min` would
//! return the non-NaN operand. `nearest` rounds ties to even.

macro_rules! float_ops {
    ($ty:ty, $min:ident, $max:ident, $nearest:ident) => {
        pub fn $min(c1: $ty, c2: $ty) -> $ty {
            if c1.is_nan() || c2.is_nan() {
                <$ty>::NAN
            } else if c1 == 0.0 && c2 == 0.0 {
                if c1.is_sign_negative() {
                    c1
                } else {
                    c2
                }
            } else {
                c1.min(c2)
            }
        }

        pub fn $max(c1: $ty, c2: $ty) -> $ty {
            if c1.is_nan() || c2.is_nan() {
                <$ty>::NAN
            } else if c1 == 0.0 && c2 == 0.0 {
                if c1.is_sign_negative() {
                    c2
                } else {
                    c1
                }
            } else {
                c1.max(c2)
            }
        }

        pub fn $nearest(value: $ty) -> $ty {
            value.round_ties_even()
        }
    };
}

float_ops!(f32, f32_min, f32_max, f32_nearest);
float_ops!(f64, f64_min, f64_max, f64_nearest);
