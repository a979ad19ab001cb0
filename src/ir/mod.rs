//! Intermediate representation shared by both engines
//!
//! [`builder::build_function`] translates one function's raw instruction bytes
//! into a flat list of [`Instr`]s. Structured control flow is gone: every
//! branch carries a resolved [`BranchTarget`] (absolute op index, the operand
//! height to unwind to and the number of values it carries), and every op
//! records the operand-stack height in effect before it runs. Ops that follow
//! an unconditional transfer of control are kept but flagged as unreachable.

pub mod builder;
pub mod numeric;
pub mod reader;

pub use builder::build_function;
pub use numeric::NumericOp;

use crate::module::{FunctionType, ValueType};
use crate::runtime::Value;

/// Resolved destination of a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    /// Index into [`IrFunction::ops`] where execution continues
    pub pc: usize,
    /// Operand height (relative to the frame's operand base) after the branch
    pub height: u32,
    /// Number of values carried from the top of the stack to `height`
    pub arity: u32,
}

impl BranchTarget {
    pub(crate) const UNRESOLVED: usize = usize::MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
}

impl LoadKind {
    pub fn width(self) -> u32 {
        match self {
            LoadKind::I32S8 | LoadKind::I32U8 | LoadKind::I64S8 | LoadKind::I64U8 => 1,
            LoadKind::I32S16 | LoadKind::I32U16 | LoadKind::I64S16 | LoadKind::I64U16 => 2,
            LoadKind::I32 | LoadKind::F32 | LoadKind::I64S32 | LoadKind::I64U32 => 4,
            LoadKind::I64 | LoadKind::F64 => 8,
        }
    }

    pub fn result_type(self) -> ValueType {
        match self {
            LoadKind::I32 | LoadKind::I32S8 | LoadKind::I32U8 | LoadKind::I32S16 | LoadKind::I32U16 => ValueType::I32,
            LoadKind::F32 => ValueType::F32,
            LoadKind::F64 => ValueType::F64,
            _ => ValueType::I64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32As8,
    I32As16,
    I64As8,
    I64As16,
    I64As32,
}

impl StoreKind {
    pub fn width(self) -> u32 {
        match self {
            StoreKind::I32As8 | StoreKind::I64As8 => 1,
            StoreKind::I32As16 | StoreKind::I64As16 => 2,
            StoreKind::I32 | StoreKind::F32 | StoreKind::I64As32 => 4,
            StoreKind::I64 | StoreKind::F64 => 8,
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            StoreKind::I32 | StoreKind::I32As8 | StoreKind::I32As16 => ValueType::I32,
            StoreKind::F32 => ValueType::F32,
            StoreKind::F64 => ValueType::F64,
            _ => ValueType::I64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Unreachable,
    Br(BranchTarget),
    BrIf(BranchTarget),
    /// Pops an i32 and branches when it is zero; the lowering of `if`
    BrUnless(BranchTarget),
    BrTable {
        targets: Box<[BranchTarget]>,
        default: BranchTarget,
    },
    /// Leaves the function with the top `results` values
    Return,
    Call(u32),
    /// Indirect call through table 0, checked against the type index
    CallIndirect(u32),
    Drop(ValueType),
    Select(ValueType),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load { kind: LoadKind, offset: u32 },
    Store { kind: StoreKind, offset: u32 },
    MemorySize,
    MemoryGrow,
    Const(Value),
    Numeric(NumericOp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Operation,
    /// Operand-stack height before the op executes
    pub height: u32,
    /// False for code that no control path reaches
    pub reachable: bool,
}

/// One function lowered to IR
#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    /// Index in the module's function index space
    pub index: u32,
    pub ty: FunctionType,
    /// Parameters followed by declared locals
    pub locals: Vec<ValueType>,
    pub ops: Vec<Instr>,
    pub max_height: u32,
}

impl IrFunction {
    pub fn param_count(&self) -> usize {
        self.ty.parameters.len()
    }

    pub fn result_count(&self) -> usize {
        self.ty.return_types.len()
    }

    /// Slots needed for locals plus the deepest operand stack
    pub fn frame_slots(&self) -> usize {
        self.locals.len() + self.max_height as usize
    }
}

/// Why a function body was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unexpected end of function body")]
    UnexpectedEof,
    #[error("malformed LEB128 immediate")]
    MalformedLeb,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("invalid block type 0x{0:02x}")]
    InvalidBlockType(u8),
    #[error("zero byte expected")]
    ZeroByteExpected,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("block ends with {found} values, expected {expected}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("unknown label {0}")]
    UnknownLabel(u32),
    #[error("unknown local {0}")]
    UnknownLocal(u32),
    #[error("unknown global {0}")]
    UnknownGlobal(u32),
    #[error("global {0} is immutable")]
    ImmutableGlobal(u32),
    #[error("unknown function {0}")]
    UnknownFunction(u32),
    #[error("unknown type {0}")]
    UnknownType(u32),
    #[error("unknown memory")]
    MissingMemory,
    #[error("unknown table")]
    MissingTable,
    #[error("alignment must not be larger than natural")]
    InvalidAlignment,
    #[error("else without matching if")]
    UnexpectedElse,
    #[error("br_table targets disagree on arity")]
    BrTableArity,
    #[error("trailing bytes after function end")]
    TrailingBytes,
    #[error("too many locals")]
    TooManyLocals,
}
