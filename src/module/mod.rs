//! In-memory WebAssembly module description
//!
//! A [`Module`] is the already-decoded form of a WebAssembly module: types,
//! imports, function bodies, table/memory limits, globals, exports, segments,
//! the optional start function and an optional name map. Decoders (binary or
//! text) produce it; the [`Store`](crate::store::Store) consumes it. Function
//! bodies are kept as raw instruction bytes in the binary encoding and are
//! translated to IR at compile time.
//!
//! Modules can also be assembled directly, which is how tests and embedders
//! without a decoder build them:
//!
//! ```
//! use wasmite::module::{code::CodeBuilder, FunctionType, Locals, Module, ValueType};
//! use wasmite::module::opcode;
//!
//! let mut module = Module::new();
//! let add = module.add_type(FunctionType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]));
//! let body = CodeBuilder::new()
//!     .local_get(0)
//!     .local_get(1)
//!     .op(opcode::I32_ADD)
//!     .end()
//!     .finish();
//! let func = module.add_function(add, Locals::empty(), body);
//! module.export_function("add", func);
//! assert!(module.validate().is_ok());
//! ```

pub mod code;
pub mod opcode;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::FormatError;

/// Largest number of 64 KiB pages addressable by a 32-bit memory
pub const MAX_PAGES: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub fn decode(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(ValueType::I32),
            0x7e => Some(ValueType::I64),
            0x7d => Some(ValueType::F32),
            0x7c => Some(ValueType::F64),
            _ => None,
        }
    }

    pub fn encode(&self) -> u8 {
        match self {
            ValueType::I32 => 0x7f,
            ValueType::I64 => 0x7e,
            ValueType::F32 => 0x7d,
            ValueType::F64 => 0x7c,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionType {
    pub parameters: Vec<ValueType>,
    pub return_types: Vec<ValueType>,
}

impl FunctionType {
    pub fn new(parameters: Vec<ValueType>, return_types: Vec<ValueType>) -> Self {
        FunctionType {
            parameters,
            return_types,
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let join = |types: &[ValueType]| types.iter().map(ToString::to_string).collect::<Vec<String>>().join(", ");
        write!(f, "({}) -> ", join(&self.parameters))?;
        match self.return_types.len() {
            0 => write!(f, "nil"),
            1 => write!(f, "{}", self.return_types[0]),
            _ => write!(f, "({})", join(&self.return_types)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Limits { min, max }
    }

    /// Whether an entity with these (actual) limits may satisfy an import declaring `expected`.
    ///
    /// The actual minimum must be at least the declared one, and a declared maximum requires an
    /// actual maximum that is no larger.
    pub fn satisfies(&self, expected: &Limits) -> bool {
        if self.min < expected.min {
            return false;
        }
        match (expected.max, self.max) {
            (None, _) => true,
            (Some(expected_max), Some(actual_max)) => actual_max <= expected_max,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "min = {}, max = {}", self.min, max),
            None => write!(f, "min = {}", self.min),
        }
    }
}

/// A table of function references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub value_type: ValueType,
    pub mutable: bool,
}

/// Constant initializer expression for globals and segment offsets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstExpr {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// Reads an imported global
    GlobalGet(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub global_type: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalKind {
    /// Function import with its type index
    Function(u32),
    Table(TableType),
    Memory(Limits),
    Global(GlobalType),
}

impl ExternalKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExternalKind::Function(_) => "function",
            ExternalKind::Table(_) => "table",
            ExternalKind::Memory(_) => "memory",
            ExternalKind::Global(_) => "global",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub external_kind: ExternalKind,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <{}.{}>", self.external_kind.name(), self.module, self.name)
    }
}

/// Declared locals of a function body as run-length `(count, type)` entries
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Locals {
    entries: Vec<(u32, ValueType)>,
}

impl Locals {
    pub fn new(entries: Vec<(u32, ValueType)>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> u64 {
        self.entries.iter().map(|(count, _)| *count as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (u32, ValueType)> {
        self.entries.iter()
    }

    pub fn get(&self, index: u32) -> Option<&ValueType> {
        let mut remaining = index;
        for (count, value_type) in &self.entries {
            if remaining < *count {
                return Some(value_type);
            }
            remaining -= count;
        }
        None
    }
}

/// A locally defined function: its type, declared locals and raw instruction bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub ftype_index: u32,
    pub locals: Locals,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportIndex {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub index: ExportIndex,
}

/// Active element segment writing function references into table 0
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub table_index: u32,
    pub offset: ConstExpr,
    pub functions: Vec<u32>,
}

/// Active data segment writing bytes into memory 0
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub memory_index: u32,
    pub offset: ConstExpr,
    pub init: Vec<u8>,
}

/// Debug names carried by the custom "name" section. Never affects execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameSection {
    pub module_name: Option<String>,
    pub function_names: BTreeMap<u32, String>,
    pub local_names: BTreeMap<u32, BTreeMap<u32, String>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub types: Vec<FunctionType>,
    pub imports: Vec<Import>,
    pub functions: Vec<Function>,
    pub tables: Vec<TableType>,
    pub memories: Vec<Limits>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub data: Vec<Data>,
    pub names: Option<NameSection>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // Assembly helpers ---------------------------------------------------------

    /// Add a function type, reusing an identical existing entry. Returns the type index.
    pub fn add_type(&mut self, function_type: FunctionType) -> u32 {
        if let Some(index) = self.types.iter().position(|t| *t == function_type) {
            return index as u32;
        }
        self.types.push(function_type);
        (self.types.len() - 1) as u32
    }

    /// Import a function. Returns its index in the function index space.
    ///
    /// Imports must be added before local functions, as the index space places imports first.
    pub fn import_function(&mut self, module: &str, name: &str, ftype_index: u32) -> u32 {
        self.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            external_kind: ExternalKind::Function(ftype_index),
        });
        self.imported_function_count() - 1
    }

    pub fn import(&mut self, module: &str, name: &str, external_kind: ExternalKind) {
        self.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            external_kind,
        });
    }

    /// Define a local function. Returns its index in the function index space.
    pub fn add_function(&mut self, ftype_index: u32, locals: Locals, body: Vec<u8>) -> u32 {
        self.functions.push(Function {
            ftype_index,
            locals,
            body,
        });
        self.function_count() - 1
    }

    pub fn add_global(&mut self, global_type: GlobalType, init: ConstExpr) -> u32 {
        self.globals.push(Global { global_type, init });
        self.global_count() - 1
    }

    pub fn export(&mut self, name: &str, index: ExportIndex) {
        self.exports.push(Export {
            name: name.to_string(),
            index,
        });
    }

    pub fn export_function(&mut self, name: &str, function_index: u32) {
        self.export(name, ExportIndex::Function(function_index));
    }

    // Index spaces -------------------------------------------------------------

    pub fn imported_function_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Function(_)))
            .count() as u32
    }

    pub fn function_count(&self) -> u32 {
        self.imported_function_count() + self.functions.len() as u32
    }

    pub fn imported_global_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Global(_)))
            .count() as u32
    }

    pub fn global_count(&self) -> u32 {
        self.imported_global_count() + self.globals.len() as u32
    }

    pub fn table_count(&self) -> u32 {
        let imported = self
            .imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Table(_)))
            .count();
        (imported + self.tables.len()) as u32
    }

    pub fn memory_count(&self) -> u32 {
        let imported = self
            .imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Memory(_)))
            .count();
        (imported + self.memories.len()) as u32
    }

    /// Type index of a function in the combined import + local index space
    pub fn function_type_index(&self, function_index: u32) -> Option<u32> {
        let mut remaining = function_index;
        for import in &self.imports {
            if let ExternalKind::Function(type_index) = import.external_kind {
                if remaining == 0 {
                    return Some(type_index);
                }
                remaining -= 1;
            }
        }
        self.functions.get(remaining as usize).map(|f| f.ftype_index)
    }

    pub fn function_type(&self, function_index: u32) -> Option<&FunctionType> {
        self.function_type_index(function_index)
            .and_then(|index| self.types.get(index as usize))
    }

    /// Global type in the combined import + local index space
    pub fn global_type(&self, global_index: u32) -> Option<GlobalType> {
        let mut remaining = global_index;
        for import in &self.imports {
            if let ExternalKind::Global(global_type) = import.external_kind {
                if remaining == 0 {
                    return Some(global_type);
                }
                remaining -= 1;
            }
        }
        self.globals.get(remaining as usize).map(|g| g.global_type)
    }

    /// Debug name of a function from the name section, if present
    pub fn function_name(&self, function_index: u32) -> Option<&str> {
        self.names
            .as_ref()
            .and_then(|names| names.function_names.get(&function_index))
            .map(String::as_str)
    }

    // Validation ---------------------------------------------------------------

    /// Check that every index referenced outside function bodies is in range for the combined
    /// import + local index spaces. Function bodies are checked by the IR builder.
    pub fn validate(&self) -> Result<(), FormatError> {
        let type_count = self.types.len();
        let check_type = |index: u32| -> Result<(), FormatError> {
            if (index as usize) < type_count {
                Ok(())
            } else {
                Err(FormatError::TypeIndexOutOfRange { index, len: type_count })
            }
        };

        for import in &self.imports {
            match &import.external_kind {
                ExternalKind::Function(type_index) => check_type(*type_index)?,
                ExternalKind::Table(table_type) => check_limits(&table_type.limits, u32::MAX)?,
                ExternalKind::Memory(limits) => check_limits(limits, MAX_PAGES)?,
                ExternalKind::Global(_) => {}
            }
        }
        for function in &self.functions {
            check_type(function.ftype_index)?;
        }
        if self.table_count() > 1 {
            return Err(FormatError::MultipleTables);
        }
        if self.memory_count() > 1 {
            return Err(FormatError::MultipleMemories);
        }
        for table in &self.tables {
            check_limits(&table.limits, u32::MAX)?;
        }
        for memory in &self.memories {
            check_limits(memory, MAX_PAGES)?;
        }

        let imported_globals = self.imported_global_count();
        for global in &self.globals {
            let init_type = self.const_expr_type(&global.init, imported_globals)?;
            if init_type != global.global_type.value_type {
                return Err(FormatError::InvalidConstExpr(format!(
                    "global initializer produces {init_type}, expected {}",
                    global.global_type.value_type
                )));
            }
        }

        let function_count = self.function_count();
        let check_function = |index: u32| -> Result<(), FormatError> {
            if index < function_count {
                Ok(())
            } else {
                Err(FormatError::FunctionIndexOutOfRange {
                    index,
                    len: function_count as usize,
                })
            }
        };

        for export in &self.exports {
            match export.index {
                ExportIndex::Function(index) => check_function(index)?,
                ExportIndex::Table(index) => check_index(index, self.table_count(), "table")?,
                ExportIndex::Memory(index) => check_index(index, self.memory_count(), "memory")?,
                ExportIndex::Global(index) => check_index(index, self.global_count(), "global")?,
            }
        }

        if let Some(start) = self.start {
            check_function(start)?;
            let found = self.function_type(start).cloned().unwrap_or_default();
            if !found.parameters.is_empty() || !found.return_types.is_empty() {
                return Err(FormatError::InvalidStartFunction { index: start, found });
            }
        }

        for element in &self.elements {
            check_index(element.table_index, self.table_count(), "table")?;
            if self.const_expr_type(&element.offset, imported_globals)? != ValueType::I32 {
                return Err(FormatError::InvalidConstExpr("element offset must be i32".to_string()));
            }
            for &function in &element.functions {
                check_function(function)?;
            }
        }
        for data in &self.data {
            check_index(data.memory_index, self.memory_count(), "memory")?;
            if self.const_expr_type(&data.offset, imported_globals)? != ValueType::I32 {
                return Err(FormatError::InvalidConstExpr("data offset must be i32".to_string()));
            }
        }

        Ok(())
    }

    /// Result type of a constant expression. `global.get` may only read immutable imported globals.
    fn const_expr_type(&self, expr: &ConstExpr, imported_globals: u32) -> Result<ValueType, FormatError> {
        match expr {
            ConstExpr::I32Const(_) => Ok(ValueType::I32),
            ConstExpr::I64Const(_) => Ok(ValueType::I64),
            ConstExpr::F32Const(_) => Ok(ValueType::F32),
            ConstExpr::F64Const(_) => Ok(ValueType::F64),
            ConstExpr::GlobalGet(index) => {
                if *index >= imported_globals {
                    return Err(FormatError::InvalidConstExpr(format!(
                        "global.get {index} does not refer to an imported global"
                    )));
                }
                match self.global_type(*index) {
                    Some(global_type) if !global_type.mutable => Ok(global_type.value_type),
                    Some(_) => Err(FormatError::InvalidConstExpr(format!(
                        "global.get {index} refers to a mutable global"
                    ))),
                    None => Err(FormatError::GlobalIndexOutOfRange {
                        index: *index,
                        len: imported_globals as usize,
                    }),
                }
            }
        }
    }
}

fn check_index(index: u32, len: u32, kind: &'static str) -> Result<(), FormatError> {
    if index < len {
        Ok(())
    } else {
        Err(FormatError::IndexOutOfRange {
            kind,
            index,
            len: len as usize,
        })
    }
}

fn check_limits(limits: &Limits, ceiling: u32) -> Result<(), FormatError> {
    if limits.min > ceiling || limits.max.is_some_and(|max| max > ceiling) {
        return Err(FormatError::InvalidLimits(format!("{limits} exceeds {ceiling}")));
    }
    if limits.max.is_some_and(|max| max < limits.min) {
        return Err(FormatError::InvalidLimits(format!("{limits}: maximum below minimum")));
    }
    Ok(())
}
