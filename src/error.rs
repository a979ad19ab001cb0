//! Errors reported by the store and its engines
//!
//! Failures fall into three disjoint runtime kinds: the module is malformed or
//! cannot be linked ([`FormatError`]), the guest violated WebAssembly semantics
//! ([`Trap`]), or a host callable failed ([`HostError`]). Two further kinds
//! describe embedder-side problems: native lowering was refused
//! ([`CompileError`]) or the API was misused ([`UsageError`]).

use crate::engine::EngineKind;
use crate::host::HostError;
use crate::ir::ValidationError;
use crate::module::{FunctionType, ValueType};
use crate::runtime::trap::{Trap, TrapKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("host function {function} failed: {source}")]
    Host {
        function: String,
        #[source]
        source: HostError,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    /// The trap reason, if this error is a trap
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            Error::Trap(trap) => Some(trap.kind()),
            _ => None,
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format(_))
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Error::Host { .. })
    }
}

impl From<TrapKind> for Error {
    fn from(kind: TrapKind) -> Self {
        Error::Trap(Trap::new(kind))
    }
}

/// Malformed, out-of-range or unlinkable module
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("type index {index} is out of range [0..{len})")]
    TypeIndexOutOfRange { index: u32, len: usize },
    #[error("function index {index} is out of range [0..{len})")]
    FunctionIndexOutOfRange { index: u32, len: usize },
    #[error("global index {index} is out of range [0..{len})")]
    GlobalIndexOutOfRange { index: u32, len: usize },
    #[error("{kind} index {index} is out of range [0..{len})")]
    IndexOutOfRange { kind: &'static str, index: u32, len: usize },
    #[error("multiple tables")]
    MultipleTables,
    #[error("multiple memories")]
    MultipleMemories,
    #[error("invalid limits: {0}")]
    InvalidLimits(String),
    #[error("invalid constant expression: {0}")]
    InvalidConstExpr(String),
    #[error("start function {index} must have type () -> nil, found {found}")]
    InvalidStartFunction { index: u32, found: FunctionType },
    /// `function` is the debug name when the module carries one, otherwise the index
    #[error("function {function}: {source}")]
    InvalidFunction {
        function: String,
        #[source]
        source: ValidationError,
    },
    #[error("unknown import {module}.{name}")]
    UnknownImport { module: String, name: String },
    #[error("import {module}.{name}: expected {expected}, found {actual}")]
    ImportKindMismatch {
        module: String,
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("import {module}.{name}: signature mismatch, expected {expected}, found {actual}")]
    ImportSignatureMismatch {
        module: String,
        name: String,
        expected: FunctionType,
        actual: FunctionType,
    },
    #[error("import {module}.{name}: incompatible limits")]
    IncompatibleImportLimits { module: String, name: String },
    #[error("import {module}.{name}: global type mismatch, expected {expected} (mutable: {mutable})")]
    ImportGlobalMismatch {
        module: String,
        name: String,
        expected: ValueType,
        mutable: bool,
    },
    #[error("{0} segment does not fit")]
    SegmentOutOfBounds(&'static str),
}

/// Native lowering was refused; the interpreter remains usable
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("function {function}: {reason}")]
    Unsupported { function: u32, reason: String },
    /// Mapping executable code or a native stack failed
    #[error("native memory: {0}")]
    NativeMemory(#[from] std::io::Error),
}

/// The embedding API was used incorrectly
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UsageError {
    #[error("instance {0} already exists")]
    DuplicateInstance(String),
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("unknown export {instance}.{export}")]
    UnknownExport { instance: String, export: String },
    #[error("export {instance}.{export} is not a {expected}")]
    ExportKind {
        instance: String,
        export: String,
        expected: &'static str,
    },
    #[error("host function {module}.{name} is already registered")]
    DuplicateHostFunction { module: String, name: String },
    #[error("expected {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("argument {index}: expected {expected}, got {actual}")]
    ArgumentType {
        index: usize,
        expected: ValueType,
        actual: ValueType,
    },
    #[error("{0} engine is not available on this host")]
    EngineUnavailable(EngineKind),
    #[error("module was compiled for the {compiled} engine, store runs {store}")]
    EngineMismatch { compiled: EngineKind, store: EngineKind },
    #[error("instance {instance} is imported by {dependent}")]
    InstanceInUse { instance: String, dependent: String },
}
