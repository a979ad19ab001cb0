//! Stack-only numeric instructions
//!
//! Every MVP instruction between `i32.eqz` (0x45) and `f64.reinterpret_i64`
//! (0xbf) pops one or two operands and pushes one result, with no immediates
//! and no access to memory, locals or globals. They are carried through the IR
//! as a single [`NumericOp`] and evaluated by `runtime::ops::eval`.

use crate::module::opcode::*;
use crate::module::ValueType;
use std::fmt;

use ValueType::{F32, F64, I32, I64};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumericOp(u8);

impl NumericOp {
    pub fn from_opcode(opcode: u8) -> Option<NumericOp> {
        (I32_EQZ..=F64_REINTERPRET_I64)
            .contains(&opcode)
            .then_some(NumericOp(opcode))
    }

    pub fn opcode(self) -> u8 {
        self.0
    }

    /// Operand types, bottom of stack first, and the result type
    pub fn signature(self) -> (&'static [ValueType], ValueType) {
        match self.0 {
            I32_EQZ => (&[I32], I32),
            I32_EQ..=I32_GE_U => (&[I32, I32], I32),
            I64_EQZ => (&[I64], I32),
            I64_EQ..=I64_GE_U => (&[I64, I64], I32),
            F32_EQ..=F32_GE => (&[F32, F32], I32),
            F64_EQ..=F64_GE => (&[F64, F64], I32),
            I32_CLZ..=I32_POPCNT => (&[I32], I32),
            I32_ADD..=I32_ROTR => (&[I32, I32], I32),
            I64_CLZ..=I64_POPCNT => (&[I64], I64),
            I64_ADD..=I64_ROTR => (&[I64, I64], I64),
            F32_ABS..=F32_SQRT => (&[F32], F32),
            F32_ADD..=F32_COPYSIGN => (&[F32, F32], F32),
            F64_ABS..=F64_SQRT => (&[F64], F64),
            F64_ADD..=F64_COPYSIGN => (&[F64, F64], F64),
            I32_WRAP_I64 => (&[I64], I32),
            I32_TRUNC_F32_S | I32_TRUNC_F32_U | I32_REINTERPRET_F32 => (&[F32], I32),
            I32_TRUNC_F64_S | I32_TRUNC_F64_U => (&[F64], I32),
            I64_EXTEND_I32_S | I64_EXTEND_I32_U => (&[I32], I64),
            I64_TRUNC_F32_S | I64_TRUNC_F32_U => (&[F32], I64),
            I64_TRUNC_F64_S | I64_TRUNC_F64_U | I64_REINTERPRET_F64 => (&[F64], I64),
            F32_CONVERT_I32_S | F32_CONVERT_I32_U | F32_REINTERPRET_I32 => (&[I32], F32),
            F32_CONVERT_I64_S | F32_CONVERT_I64_U => (&[I64], F32),
            F32_DEMOTE_F64 => (&[F64], F32),
            F64_CONVERT_I32_S | F64_CONVERT_I32_U => (&[I32], F64),
            F64_CONVERT_I64_S | F64_CONVERT_I64_U | F64_REINTERPRET_I64 => (&[I64], F64),
            F64_PROMOTE_F32 => (&[F32], F64),
            other => unreachable!("0x{other:02x} is outside the numeric opcode range"),
        }
    }

    pub fn arity(self) -> usize {
        self.signature().0.len()
    }

    /// Whether evaluation can trap (integer division and float truncation)
    pub fn can_trap(self) -> bool {
        matches!(
            self.0,
            I32_DIV_S
                | I32_DIV_U
                | I32_REM_S
                | I32_REM_U
                | I64_DIV_S
                | I64_DIV_U
                | I64_REM_S
                | I64_REM_U
                | I32_TRUNC_F32_S
                | I32_TRUNC_F32_U
                | I32_TRUNC_F64_S
                | I32_TRUNC_F64_U
                | I64_TRUNC_F32_S
                | I64_TRUNC_F32_U
                | I64_TRUNC_F64_S
                | I64_TRUNC_F64_U
        )
    }
}

impl fmt::Debug for NumericOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NumericOp(0x{:02x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        assert!(NumericOp::from_opcode(I32_CONST).is_none());
        assert!(NumericOp::from_opcode(0xc0).is_none());
        for opcode in I32_EQZ..=F64_REINTERPRET_I64 {
            let op = NumericOp::from_opcode(opcode).unwrap();
            let (params, _) = op.signature();
            assert!(matches!(params.len(), 1 | 2), "0x{opcode:02x}");
        }
    }

    #[test]
    fn test_signatures() {
        let sig = |opcode| NumericOp::from_opcode(opcode).unwrap().signature();
        assert_eq!(sig(I64_EQZ), (&[I64][..], I32));
        assert_eq!(sig(F64_LT), (&[F64, F64][..], I32));
        assert_eq!(sig(I64_SHL), (&[I64, I64][..], I64));
        assert_eq!(sig(I32_WRAP_I64), (&[I64][..], I32));
        assert_eq!(sig(F64_PROMOTE_F32), (&[F32][..], F64));
        assert_eq!(sig(F32_REINTERPRET_I32), (&[I32][..], F32));
    }

    #[test]
    fn test_can_trap() {
        assert!(NumericOp::from_opcode(I32_DIV_S).unwrap().can_trap());
        assert!(NumericOp::from_opcode(I64_TRUNC_F64_U).unwrap().can_trap());
        assert!(!NumericOp::from_opcode(F32_DIV).unwrap().can_trap());
        assert!(!NumericOp::from_opcode(I32_ADD).unwrap().can_trap());
    }
}
