//! Traps: abnormal termination defined by WebAssembly semantics
//!
//! A trap unwinds every active frame of the current invocation and is reported
//! to the caller of [`Store::invoke`](crate::store::Store::invoke). Both engines
//! raise the same [`TrapKind`] for the same condition; the compiled engine
//! carries it across native frames as a nonzero status code.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum TrapKind {
    #[error("unreachable")]
    Unreachable,
    #[error("out of bounds memory access")]
    OutOfBoundsMemoryAccess,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("indirect call type mismatch")]
    IndirectCallSignatureMismatch,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("undefined element")]
    UndefinedElement,
}

impl TrapKind {
    const ALL: [TrapKind; 9] = [
        TrapKind::Unreachable,
        TrapKind::OutOfBoundsMemoryAccess,
        TrapKind::IntegerDivideByZero,
        TrapKind::IntegerOverflow,
        TrapKind::InvalidConversionToInteger,
        TrapKind::CallStackExhausted,
        TrapKind::IndirectCallSignatureMismatch,
        TrapKind::UninitializedElement,
        TrapKind::UndefinedElement,
    ];

    /// Nonzero status code used by native code. Zero means success.
    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|k| *k == self).map(|p| p as u32 + 1).unwrap_or(u32::MAX)
    }

    pub fn from_code(code: u32) -> Option<TrapKind> {
        code.checked_sub(1).and_then(|i| Self::ALL.get(i as usize)).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("trap: {kind}")]
pub struct Trap {
    kind: TrapKind,
}

impl Trap {
    pub fn new(kind: TrapKind) -> Self {
        Trap { kind }
    }

    pub fn kind(&self) -> TrapKind {
        self.kind
    }
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Trap::new(kind)
    }
}
