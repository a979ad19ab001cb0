//! The store: compilation, instantiation, linking and invocation
//!
//! The Store owns every module instance and a single function address space
//! shared by all of them, so a function keeps its [`FuncAddr`] when it is
//! imported by another instance or placed in a table.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        Store                         │
//! │  Function space (FuncAddr -> FunctionInstance)       │
//! │   [0]: Host  env.print                               │
//! │   [1]: Guest { instance: #0, index: 0 }              │
//! │   [2]: Guest { instance: #1, index: 0 }              │
//! │  Instances (InstanceId -> ModuleInstance)            │
//! │   #0: "lib"                                          │
//! │   #1: "app"   (imports lib.*)                        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! - Imports resolve against registered host functions first, then against
//!   the exports of the instance whose name matches the import's module.
//! - A failed instantiation leaves no named instance behind.
//! - Removing an instance releases its compiled code once no other instance
//!   or caller holds it; its function addresses remain as tombstones.
//! - Execution is delegated to the engine fixed by [`Config::engine`].

pub mod instance;
mod link;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace, warn};

pub use instance::{Extern, ModuleInstance};

use crate::config::Config;
use crate::engine::{CompiledModule, EngineKind};
use crate::error::{Error, FormatError, UsageError};
use crate::host::HostFunction;
use crate::interpreter::Interpreter;
use crate::module::{ExportIndex, FunctionType, Module};
use crate::runtime::{Global, Memory, SharedGlobal, SharedMemory, Table, Value};

/// Address of a function in the store's function space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncAddr(pub usize);

/// Handle of an instance; never reused within a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum FunctionInstance {
    Guest {
        instance: InstanceId,
        module: Rc<CompiledModule>,
        /// Index among the module's locally defined functions
        index: u32,
        ty: FunctionType,
    },
    Host(HostFunction),
    /// Left behind by a removed instance so addresses stay stable; calls trap
    Removed(FunctionType),
}

impl FunctionInstance {
    pub fn ty(&self) -> &FunctionType {
        match self {
            FunctionInstance::Guest { ty, .. } => ty,
            FunctionInstance::Host(host) => host.ty(),
            FunctionInstance::Removed(ty) => ty,
        }
    }
}

pub struct Store {
    config: Config,
    functions: Vec<FunctionInstance>,
    /// Removed or failed instances leave `None` so ids stay unique
    instances: Vec<Option<ModuleInstance>>,
    names: HashMap<String, InstanceId>,
    host_functions: HashMap<(String, String), FuncAddr>,
    compiled: Vec<Rc<CompiledModule>>,
}

impl Store {
    /// A store running the host's preferred engine with default limits
    pub fn new() -> Self {
        Store::unchecked(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        if !config.engine.is_available() {
            warn!("{} engine requested but not available on this host", config.engine);
            return Err(UsageError::EngineUnavailable(config.engine).into());
        }
        Ok(Store::unchecked(config))
    }

    fn unchecked(config: Config) -> Self {
        debug!("new store: {} engine", config.engine);
        Store {
            config,
            functions: Vec::new(),
            instances: Vec::new(),
            names: HashMap::new(),
            host_functions: HashMap::new(),
            compiled: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> EngineKind {
        self.config.engine
    }

    /// Validate and lower `module` for this store's engine.
    ///
    /// Structurally equal modules share one compiled module.
    pub fn compile(&mut self, module: &Module) -> Result<Rc<CompiledModule>, Error> {
        if let Some(compiled) = self.compiled.iter().find(|compiled| compiled.module() == module) {
            trace!("compile: reusing cached module");
            return Ok(Rc::clone(compiled));
        }
        let compiled = Rc::new(CompiledModule::compile(module, self.config.engine)?);
        self.compiled.push(Rc::clone(&compiled));
        Ok(compiled)
    }

    /// Compile (or reuse) `module` and instantiate it under `name`
    pub fn instantiate_module(&mut self, module: &Module, name: &str) -> Result<InstanceId, Error> {
        let compiled = self.compile(module)?;
        let result = self.instantiate(&compiled, name);
        if result.is_err() {
            drop(compiled);
            self.evict_unused();
        }
        result
    }

    pub fn instantiate(&mut self, compiled: &Rc<CompiledModule>, name: &str) -> Result<InstanceId, Error> {
        if compiled.engine() != self.config.engine {
            return Err(UsageError::EngineMismatch {
                compiled: compiled.engine(),
                store: self.config.engine,
            }
            .into());
        }
        if self.names.contains_key(name) {
            return Err(UsageError::DuplicateInstance(name.to_string()).into());
        }

        let module = compiled.module();
        let mut imports = link::resolve_imports(self, module)?;
        let id = InstanceId(self.instances.len());
        let first_local = self.functions.len();

        let mut functions = std::mem::take(&mut imports.functions);
        for (index, function) in module.functions.iter().enumerate() {
            let addr = self.allocate_function(FunctionInstance::Guest {
                instance: id,
                module: Rc::clone(compiled),
                index: index as u32,
                ty: module.types[function.ftype_index as usize].clone(),
            });
            functions.push(addr);
        }

        let instance = match self.build_instance(id, name, compiled, imports, functions) {
            Ok(instance) => instance,
            Err(err) => {
                self.functions.truncate(first_local);
                return Err(err);
            }
        };
        let start = module.start.map(|index| instance.function(index));

        self.instances.push(Some(instance));
        self.names.insert(name.to_string(), id);
        debug!(
            "instantiated {name} as {id}: {} functions, {} imports",
            module.functions.len(),
            module.imports.len()
        );

        if let Some(start) = start {
            if let Err(err) = self.call(id, start, &[]) {
                warn!("start function of {name} failed: {err}");
                self.release_instance(id);
                self.names.remove(name);
                return Err(err);
            }
        }

        Ok(id)
    }

    /// Allocate the table, memory and globals, build the export map and apply segments
    fn build_instance(
        &self,
        id: InstanceId,
        name: &str,
        compiled: &Rc<CompiledModule>,
        imports: link::ResolvedImports,
        functions: Vec<FuncAddr>,
    ) -> Result<ModuleInstance, Error> {
        let module = compiled.module();

        let table = match imports.table {
            Some(table) => Some(table),
            None => match module.tables.first() {
                Some(table_type) => Some(Rc::new(RefCell::new(Table::new(table_type.limits)?))),
                None => None,
            },
        };
        let memory = match imports.memory {
            Some(memory) => Some(memory),
            None => match module.memories.first() {
                Some(limits) => Some(Rc::new(RefCell::new(Memory::new(*limits)?))),
                None => None,
            },
        };

        let mut globals = imports.globals;
        for global in &module.globals {
            let value = link::eval_const(&global.init, &globals)?;
            globals.push(SharedGlobal::new(Global::new(global.global_type, value)));
        }

        let mut exports = HashMap::with_capacity(module.exports.len());
        for export in &module.exports {
            let value = match export.index {
                ExportIndex::Function(index) => Extern::Function(functions[index as usize]),
                ExportIndex::Table(index) => Extern::Table(table.clone().ok_or(FormatError::IndexOutOfRange {
                    kind: "table",
                    index,
                    len: 0,
                })?),
                ExportIndex::Memory(index) => Extern::Memory(memory.clone().ok_or(FormatError::IndexOutOfRange {
                    kind: "memory",
                    index,
                    len: 0,
                })?),
                ExportIndex::Global(index) => Extern::Global(SharedGlobal::clone(&globals[index as usize])),
            };
            exports.insert(export.name.clone(), value);
        }

        let instance = ModuleInstance {
            id,
            name: name.to_string(),
            module: Rc::clone(compiled),
            functions,
            table,
            memory,
            globals,
            exports,
            dependencies: imports.dependencies,
        };
        link::initialize_segments(module, &instance)?;
        Ok(instance)
    }

    fn allocate_function(&mut self, function: FunctionInstance) -> FuncAddr {
        let addr = FuncAddr(self.functions.len());
        self.functions.push(function);
        addr
    }

    /// Make `function` importable as `module.name`
    pub fn add_host_function(&mut self, module: &str, name: &str, function: HostFunction) -> Result<(), Error> {
        let key = (module.to_string(), name.to_string());
        if self.host_functions.contains_key(&key) {
            return Err(UsageError::DuplicateHostFunction {
                module: key.0,
                name: key.1,
            }
            .into());
        }
        trace!("host function {module}.{name}: {}", function.ty());
        let addr = self.allocate_function(FunctionInstance::Host(function.named(format!("{module}.{name}"))));
        self.host_functions.insert(key, addr);
        Ok(())
    }

    /// Call the function exported as `instance.export`
    pub fn invoke(&mut self, instance: &str, export: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let (id, addr) = self.exported_function(instance, export)?;
        let ty = self.function(addr).ty();
        if args.len() != ty.parameters.len() {
            return Err(UsageError::ArgumentCount {
                expected: ty.parameters.len(),
                actual: args.len(),
            }
            .into());
        }
        for (index, (arg, expected)) in args.iter().zip(&ty.parameters).enumerate() {
            if arg.typ() != *expected {
                return Err(UsageError::ArgumentType {
                    index,
                    expected: *expected,
                    actual: arg.typ(),
                }
                .into());
            }
        }

        debug!(
            "invoke {instance}.{export}({})",
            args.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        let results = self.call(id, addr, args)?;
        trace!("{instance}.{export} returned {results:?}");
        Ok(results)
    }

    /// Run `addr` on this store's engine. `caller` supplies the memory seen by a host function.
    pub(crate) fn call(&self, caller: InstanceId, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Error> {
        if let FunctionInstance::Host(host) = self.function(addr) {
            return host.invoke(self.memory_of(caller), args);
        }
        match self.config.engine {
            EngineKind::Interpreter => Interpreter::new(self).call(addr, args),
            #[cfg(all(target_arch = "x86_64", unix))]
            EngineKind::Compiler => crate::jit::invoke(self, caller, addr, args),
            #[cfg(not(all(target_arch = "x86_64", unix)))]
            EngineKind::Compiler => Err(UsageError::EngineUnavailable(EngineKind::Compiler).into()),
        }
    }

    /// Remove a named instance. Fails while another live instance imports from it.
    pub fn remove_instance(&mut self, name: &str) -> Result<(), Error> {
        let id = self
            .names
            .get(name)
            .copied()
            .ok_or_else(|| UsageError::UnknownInstance(name.to_string()))?;
        if let Some(dependent) = self
            .instances
            .iter()
            .flatten()
            .find(|instance| instance.dependencies.contains(&id))
        {
            return Err(UsageError::InstanceInUse {
                instance: name.to_string(),
                dependent: dependent.name.clone(),
            }
            .into());
        }

        self.release_instance(id);
        self.names.remove(name);
        debug!("removed instance {name} ({id})");
        Ok(())
    }

    /// Drop instance `id`, tombstone its local functions and evict compiled
    /// modules nothing else refers to
    fn release_instance(&mut self, id: InstanceId) {
        if let Some(instance) = self.instances[id.0].take() {
            for addr in &instance.functions {
                let slot = &mut self.functions[addr.0];
                if let FunctionInstance::Guest { instance: owner, ty, .. } = slot {
                    if *owner == id {
                        let ty = ty.clone();
                        *slot = FunctionInstance::Removed(ty);
                    }
                }
            }
        }
        self.evict_unused();
    }

    fn evict_unused(&mut self) {
        let before = self.compiled.len();
        self.compiled.retain(|compiled| Rc::strong_count(compiled) > 1);
        if self.compiled.len() < before {
            trace!("evicted {} compiled modules", before - self.compiled.len());
        }
    }

    pub fn instance_id(&self, name: &str) -> Option<InstanceId> {
        self.names.get(name).copied()
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&ModuleInstance> {
        self.instance_id(name).and_then(|id| self.instance(id))
    }

    pub fn instance(&self, id: InstanceId) -> Option<&ModuleInstance> {
        self.instances.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn function(&self, addr: FuncAddr) -> &FunctionInstance {
        &self.functions[addr.0]
    }

    pub(crate) fn memory_of(&self, id: InstanceId) -> Option<SharedMemory> {
        self.instance(id).and_then(|instance| instance.memory.clone())
    }

    fn export(&self, instance: &str, export: &str) -> Result<(&ModuleInstance, &Extern), Error> {
        let module_instance = self
            .instance_by_name(instance)
            .ok_or_else(|| UsageError::UnknownInstance(instance.to_string()))?;
        let value = module_instance.export(export).ok_or_else(|| UsageError::UnknownExport {
            instance: instance.to_string(),
            export: export.to_string(),
        })?;
        Ok((module_instance, value))
    }

    fn export_kind(instance: &str, export: &str, expected: &'static str) -> Error {
        UsageError::ExportKind {
            instance: instance.to_string(),
            export: export.to_string(),
            expected,
        }
        .into()
    }

    fn exported_function(&self, instance: &str, export: &str) -> Result<(InstanceId, FuncAddr), Error> {
        match self.export(instance, export)? {
            (module_instance, Extern::Function(addr)) => Ok((module_instance.id, *addr)),
            _ => Err(Self::export_kind(instance, export, "function")),
        }
    }

    pub fn exported_function_type(&self, instance: &str, export: &str) -> Result<FunctionType, Error> {
        let (_, addr) = self.exported_function(instance, export)?;
        Ok(self.function(addr).ty().clone())
    }

    /// Shared handle to an exported memory
    pub fn instance_memory(&self, instance: &str, export: &str) -> Result<SharedMemory, Error> {
        match self.export(instance, export)? {
            (_, Extern::Memory(memory)) => Ok(SharedMemory::clone(memory)),
            _ => Err(Self::export_kind(instance, export, "memory")),
        }
    }

    /// Current value of an exported global
    pub fn global_value(&self, instance: &str, export: &str) -> Result<Value, Error> {
        match self.export(instance, export)? {
            (_, Extern::Global(global)) => Ok(global.get()),
            _ => Err(Self::export_kind(instance, export, "global")),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::module::code::CodeBuilder;
    use crate::module::{opcode, ConstExpr, ExternalKind, GlobalType, Limits, Locals, ValueType};
    use crate::runtime::TrapKind;

    fn interpreter_store() -> Store {
        Store::with_config(Config::default().with_engine(EngineKind::Interpreter)).unwrap()
    }

    fn constant_module(value: i32, export: &str) -> Module {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![ValueType::I32]));
        let f = module.add_function(ty, Locals::empty(), CodeBuilder::new().i32_const(value).end().finish());
        module.export_function(export, f);
        module
    }

    /// Imports `module.name` as `() -> i32` and re-exports a function that calls it plus one
    fn calling_module(import_module: &str, import_name: &str) -> Module {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![ValueType::I32]));
        let imported = module.import_function(import_module, import_name, ty);
        let body = CodeBuilder::new()
            .call(imported)
            .i32_const(1)
            .op(opcode::I32_ADD)
            .end()
            .finish();
        let f = module.add_function(ty, Locals::empty(), body);
        module.export_function("run", f);
        module
    }

    #[test]
    fn test_invoke_exported_function() {
        let mut store = interpreter_store();
        store.instantiate_module(&constant_module(42, "answer"), "m").unwrap();
        assert_eq!(store.invoke("m", "answer", &[]).unwrap(), vec![Value::I32(42)]);
        assert_eq!(
            store.exported_function_type("m", "answer").unwrap(),
            FunctionType::new(vec![], vec![ValueType::I32])
        );
    }

    #[test]
    fn test_wasm_to_wasm_import() {
        let mut store = interpreter_store();
        store.instantiate_module(&constant_module(41, "value"), "lib").unwrap();
        store.instantiate_module(&calling_module("lib", "value"), "app").unwrap();
        assert_eq!(store.invoke("app", "run", &[]).unwrap(), vec![Value::I32(42)]);
    }

    #[test]
    fn test_host_import_takes_priority() {
        let mut store = interpreter_store();
        store.instantiate_module(&constant_module(1, "value"), "lib").unwrap();
        store.add_host_function("lib", "value", HostFunction::wrap(|| 100)).unwrap();
        store.instantiate_module(&calling_module("lib", "value"), "app").unwrap();
        assert_eq!(store.invoke("app", "run", &[]).unwrap(), vec![Value::I32(101)]);
    }

    #[test]
    fn test_duplicate_names() {
        let mut store = interpreter_store();
        store.instantiate_module(&constant_module(1, "f"), "m").unwrap();
        let err = store.instantiate_module(&constant_module(2, "f"), "m").unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::DuplicateInstance(_))));

        store.add_host_function("env", "f", HostFunction::wrap(|| {})).unwrap();
        let err = store.add_host_function("env", "f", HostFunction::wrap(|| {})).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::DuplicateHostFunction { .. })));
    }

    #[test]
    fn test_compile_is_cached() {
        let mut store = interpreter_store();
        let module = constant_module(7, "f");
        let a = store.compile(&module).unwrap();
        let b = store.compile(&module.clone()).unwrap();
        assert!(Rc::ptr_eq(&a, &b));

        store.instantiate(&a, "one").unwrap();
        store.instantiate(&b, "two").unwrap();
        assert_eq!(store.invoke("two", "f", &[]).unwrap(), vec![Value::I32(7)]);
    }

    #[test]
    fn test_unknown_import_leaves_no_instance() {
        let mut store = interpreter_store();
        let err = store.instantiate_module(&calling_module("nowhere", "value"), "app").unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::UnknownImport { .. })), "{err}");
        assert!(store.instance_by_name("app").is_none());
        assert!(store.functions.is_empty());
    }

    #[test]
    fn test_import_kind_mismatch() {
        let mut store = interpreter_store();
        let mut lib = Module::new();
        lib.add_global(
            GlobalType {
                value_type: ValueType::I32,
                mutable: false,
            },
            ConstExpr::I32Const(3),
        );
        lib.export("value", ExportIndex::Global(0));
        store.instantiate_module(&lib, "lib").unwrap();

        let err = store.instantiate_module(&calling_module("lib", "value"), "app").unwrap_err();
        assert!(
            matches!(
                err,
                Error::Format(FormatError::ImportKindMismatch {
                    expected: "function",
                    actual: "global",
                    ..
                })
            ),
            "{err}"
        );
        assert_eq!(store.global_value("lib", "value").unwrap(), Value::I32(3));
    }

    #[test]
    fn test_memory_import_limits() {
        let mut store = interpreter_store();
        let mut lib = Module::new();
        lib.memories.push(Limits::new(1, Some(2)));
        lib.export("memory", ExportIndex::Memory(0));
        store.instantiate_module(&lib, "lib").unwrap();

        let mut too_big = Module::new();
        too_big.import("lib", "memory", ExternalKind::Memory(Limits::new(2, None)));
        let err = store.instantiate_module(&too_big, "a").unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::IncompatibleImportLimits { .. })));

        let mut fits = Module::new();
        fits.import("lib", "memory", ExternalKind::Memory(Limits::new(1, Some(4))));
        store.instantiate_module(&fits, "b").unwrap();
    }

    #[test]
    fn test_invoke_argument_checks() {
        let mut store = interpreter_store();
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![ValueType::I64], vec![ValueType::I64]));
        let f = module.add_function(ty, Locals::empty(), CodeBuilder::new().local_get(0).end().finish());
        module.export_function("id", f);
        store.instantiate_module(&module, "m").unwrap();

        let err = store.invoke("m", "id", &[]).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::ArgumentCount { expected: 1, actual: 0 })));
        let err = store.invoke("m", "id", &[Value::I32(1)]).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::ArgumentType { index: 0, .. })));
        let err = store.invoke("m", "missing", &[]).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::UnknownExport { .. })));
        let err = store.invoke("other", "id", &[]).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::UnknownInstance(_))));
        assert_eq!(store.invoke("m", "id", &[Value::I64(-9)]).unwrap(), vec![Value::I64(-9)]);
    }

    #[test]
    fn test_failing_start_function_leaves_no_instance() {
        let mut store = interpreter_store();
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![]));
        let f = module.add_function(ty, Locals::empty(), CodeBuilder::new().unreachable().end().finish());
        module.start = Some(f);

        let err = store.instantiate_module(&module, "m").unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::Unreachable));
        assert!(store.instance_by_name("m").is_none());
        store.instantiate_module(&constant_module(1, "f"), "m").unwrap();
    }

    #[test]
    fn test_remove_instance() {
        let mut store = interpreter_store();
        store.instantiate_module(&constant_module(41, "value"), "lib").unwrap();
        store.instantiate_module(&calling_module("lib", "value"), "app").unwrap();

        let err = store.remove_instance("lib").unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::InstanceInUse { .. })), "{err}");

        store.remove_instance("app").unwrap();
        store.remove_instance("lib").unwrap();
        assert!(store.instance_id("lib").is_none());
        assert!(matches!(
            store.remove_instance("lib").unwrap_err(),
            Error::Usage(UsageError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_exported_host_function() {
        let mut store = interpreter_store();
        store
            .add_host_function("env", "fail", HostFunction::wrap(|| -> Result<i32, HostError> {
                Err(HostError::new("no"))
            }))
            .unwrap();
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![ValueType::I32]));
        let imported = module.import_function("env", "fail", ty);
        module.export_function("fail", imported);
        store.instantiate_module(&module, "m").unwrap();

        match store.invoke("m", "fail", &[]).unwrap_err() {
            Error::Host { function, source } => {
                assert_eq!(function, "env.fail");
                assert_eq!(source.message(), "no");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
