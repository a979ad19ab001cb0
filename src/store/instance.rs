//! Module instances: the runtime state produced by one instantiation

use std::collections::HashMap;
use std::rc::Rc;

use super::{FuncAddr, InstanceId};
use crate::engine::CompiledModule;
use crate::runtime::{SharedGlobal, SharedMemory, SharedTable};

/// An exported entity
#[derive(Debug, Clone)]
pub enum Extern {
    Function(FuncAddr),
    Table(SharedTable),
    Memory(SharedMemory),
    Global(SharedGlobal),
}

impl Extern {
    pub fn kind(&self) -> &'static str {
        match self {
            Extern::Function(_) => "function",
            Extern::Table(_) => "table",
            Extern::Memory(_) => "memory",
            Extern::Global(_) => "global",
        }
    }
}

#[derive(Debug)]
pub struct ModuleInstance {
    pub(crate) id: InstanceId,
    pub(crate) name: String,
    pub(crate) module: Rc<CompiledModule>,
    /// Function index space: imports first, then local functions
    pub(crate) functions: Vec<FuncAddr>,
    pub(crate) table: Option<SharedTable>,
    pub(crate) memory: Option<SharedMemory>,
    /// Global index space: imports first, then local globals
    pub(crate) globals: Vec<SharedGlobal>,
    pub(crate) exports: HashMap<String, Extern>,
    /// Instances this one imports from
    pub(crate) dependencies: Vec<InstanceId>,
}

impl ModuleInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Rc<CompiledModule> {
        &self.module
    }

    pub fn export(&self, name: &str) -> Option<&Extern> {
        self.exports.get(name)
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, &Extern)> {
        self.exports.iter().map(|(name, export)| (name.as_str(), export))
    }

    pub fn memory(&self) -> Option<&SharedMemory> {
        self.memory.as_ref()
    }

    pub fn table(&self) -> Option<&SharedTable> {
        self.table.as_ref()
    }

    pub(crate) fn function(&self, index: u32) -> FuncAddr {
        self.functions[index as usize]
    }

    pub(crate) fn global(&self, index: u32) -> &SharedGlobal {
        &self.globals[index as usize]
    }
}
