//! Import resolution and segment initialization
//!
//! Each import is looked up by its exact `(module, name)` pair: first among
//! the host functions registered with the store, then among the exports of the
//! instance registered under `module`. The resolved entity must have the
//! declared kind and a compatible type before anything is allocated.

use log::trace;

use super::instance::{Extern, ModuleInstance};
use super::{FuncAddr, InstanceId, Store};
use crate::error::FormatError;
use crate::module::{ConstExpr, ExternalKind, Import, Module};
use crate::runtime::{SharedGlobal, SharedMemory, SharedTable, Value};

/// Everything a module imports, in index-space order
#[derive(Default)]
pub(super) struct ResolvedImports {
    pub functions: Vec<FuncAddr>,
    pub table: Option<SharedTable>,
    pub memory: Option<SharedMemory>,
    pub globals: Vec<SharedGlobal>,
    pub dependencies: Vec<InstanceId>,
}

#[derive(Clone, Copy)]
enum Source<'s> {
    Host(FuncAddr),
    Export(&'s ModuleInstance, &'s Extern),
}

impl Source<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Source::Host(_) => "function",
            Source::Export(_, export) => export.kind(),
        }
    }
}

fn lookup<'s>(store: &'s Store, import: &Import) -> Result<Source<'s>, FormatError> {
    if let Some(addr) = store.host_functions.get(&(import.module.clone(), import.name.clone())) {
        return Ok(Source::Host(*addr));
    }
    store
        .instance_by_name(&import.module)
        .and_then(|instance| instance.export(&import.name).map(|export| Source::Export(instance, export)))
        .ok_or_else(|| FormatError::UnknownImport {
            module: import.module.clone(),
            name: import.name.clone(),
        })
}

fn kind_mismatch(import: &Import, actual: &'static str) -> FormatError {
    FormatError::ImportKindMismatch {
        module: import.module.clone(),
        name: import.name.clone(),
        expected: import.external_kind.name(),
        actual,
    }
}

fn incompatible_limits(import: &Import) -> FormatError {
    FormatError::IncompatibleImportLimits {
        module: import.module.clone(),
        name: import.name.clone(),
    }
}

pub(super) fn resolve_imports(store: &Store, module: &Module) -> Result<ResolvedImports, FormatError> {
    let mut resolved = ResolvedImports::default();

    for import in &module.imports {
        let source = lookup(store, import)?;
        if let Source::Export(instance, _) = source {
            if !resolved.dependencies.contains(&instance.id) {
                resolved.dependencies.push(instance.id);
            }
        }

        match (&import.external_kind, source) {
            (ExternalKind::Function(type_index), source) => {
                let addr = match source {
                    Source::Host(addr) => addr,
                    Source::Export(_, Extern::Function(addr)) => *addr,
                    other => return Err(kind_mismatch(import, other.kind())),
                };
                let expected = &module.types[*type_index as usize];
                let actual = store.function(addr).ty();
                if expected != actual {
                    return Err(FormatError::ImportSignatureMismatch {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
                resolved.functions.push(addr);
            }
            (ExternalKind::Table(table_type), Source::Export(_, Extern::Table(table))) => {
                if !table.borrow().limits().satisfies(&table_type.limits) {
                    return Err(incompatible_limits(import));
                }
                resolved.table = Some(SharedTable::clone(table));
            }
            (ExternalKind::Memory(limits), Source::Export(_, Extern::Memory(memory))) => {
                if !memory.borrow().limits().satisfies(limits) {
                    return Err(incompatible_limits(import));
                }
                resolved.memory = Some(SharedMemory::clone(memory));
            }
            (ExternalKind::Global(global_type), Source::Export(_, Extern::Global(global))) => {
                if global.global_type() != *global_type {
                    return Err(FormatError::ImportGlobalMismatch {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        expected: global_type.value_type,
                        mutable: global_type.mutable,
                    });
                }
                resolved.globals.push(SharedGlobal::clone(global));
            }
            (_, source) => return Err(kind_mismatch(import, source.kind())),
        }
        trace!("resolved import {}.{}", import.module, import.name);
    }

    Ok(resolved)
}

/// Evaluate a global initializer or segment offset against the imported globals
pub(super) fn eval_const(expr: &ConstExpr, globals: &[SharedGlobal]) -> Result<Value, FormatError> {
    match expr {
        ConstExpr::I32Const(v) => Ok(Value::I32(*v)),
        ConstExpr::I64Const(v) => Ok(Value::I64(*v)),
        ConstExpr::F32Const(v) => Ok(Value::F32(*v)),
        ConstExpr::F64Const(v) => Ok(Value::F64(*v)),
        ConstExpr::GlobalGet(index) => globals
            .get(*index as usize)
            .map(|global| global.get())
            .ok_or(FormatError::GlobalIndexOutOfRange {
                index: *index,
                len: globals.len(),
            }),
    }
}

fn segment_offset(expr: &ConstExpr, globals: &[SharedGlobal]) -> Result<u32, FormatError> {
    eval_const(expr, globals)?
        .as_i32()
        .map(|offset| offset as u32)
        .ok_or_else(|| FormatError::InvalidConstExpr("segment offset must be i32".to_string()))
}

/// Apply element and data segments. Every segment is bounds-checked before any is written.
pub(super) fn initialize_segments(module: &Module, instance: &ModuleInstance) -> Result<(), FormatError> {
    let mut elements = Vec::with_capacity(module.elements.len());
    for element in &module.elements {
        let offset = segment_offset(&element.offset, &instance.globals)?;
        let table = instance.table.as_ref().ok_or(FormatError::SegmentOutOfBounds("element"))?;
        if !table.borrow().fits(offset, element.functions.len()) {
            return Err(FormatError::SegmentOutOfBounds("element"));
        }
        let functions: Vec<FuncAddr> = element.functions.iter().map(|&index| instance.function(index)).collect();
        elements.push((table, offset, functions));
    }

    let mut data = Vec::with_capacity(module.data.len());
    for segment in &module.data {
        let offset = segment_offset(&segment.offset, &instance.globals)?;
        let memory = instance.memory.as_ref().ok_or(FormatError::SegmentOutOfBounds("data"))?;
        if offset as u64 + segment.init.len() as u64 > memory.borrow().len() as u64 {
            return Err(FormatError::SegmentOutOfBounds("data"));
        }
        data.push((memory, offset, &segment.init));
    }

    for (table, offset, functions) in elements {
        table
            .borrow_mut()
            .init(offset, &functions)
            .map_err(|_| FormatError::SegmentOutOfBounds("element"))?;
    }
    for (memory, offset, bytes) in data {
        memory
            .borrow_mut()
            .write_bytes(offset, bytes)
            .map_err(|_| FormatError::SegmentOutOfBounds("data"))?;
    }

    Ok(())
}
