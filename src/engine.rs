//! Engine selection and compiled modules

use std::fmt;
use std::rc::Rc;

use log::{debug, trace};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ir::{build_function, IrFunction};
use crate::module::Module;

/// How guest code is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Executes IR directly
    Interpreter,
    /// Lowers IR to x86-64 machine code at compile time
    Compiler,
}

static HOST_ENGINE: Lazy<EngineKind> = Lazy::new(|| {
    let kind = if EngineKind::Compiler.is_available() {
        EngineKind::Compiler
    } else {
        EngineKind::Interpreter
    };
    debug!("host engine: {kind}");
    kind
});

impl EngineKind {
    pub fn is_available(self) -> bool {
        match self {
            EngineKind::Interpreter => true,
            EngineKind::Compiler => cfg!(all(target_arch = "x86_64", unix)),
        }
    }

    /// The fastest engine this process can run, probed once
    pub fn host() -> EngineKind {
        *HOST_ENGINE
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::host()
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Interpreter => write!(f, "interpreter"),
            EngineKind::Compiler => write!(f, "compiler"),
        }
    }
}

/// Engine-specific form of a module's code
#[derive(Debug)]
pub enum CompiledCode {
    Interpreted,
    #[cfg(all(target_arch = "x86_64", unix))]
    Native(crate::jit::NativeModule),
}

/// A validated module with every local function lowered for one engine
#[derive(Debug)]
pub struct CompiledModule {
    module: Module,
    engine: EngineKind,
    functions: Vec<Rc<IrFunction>>,
    code: CompiledCode,
}

impl CompiledModule {
    /// Validate `module`, build IR for each local function, then lower for `engine`
    pub(crate) fn compile(module: &Module, engine: EngineKind) -> Result<CompiledModule, Error> {
        module.validate()?;

        let imported = module.imported_function_count();
        let functions = module
            .functions
            .iter()
            .enumerate()
            .map(|(i, function)| build_function(module, imported + i as u32, function).map(Rc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let code = match engine {
            EngineKind::Interpreter => CompiledCode::Interpreted,
            #[cfg(all(target_arch = "x86_64", unix))]
            EngineKind::Compiler => CompiledCode::Native(crate::jit::compile_module(module, &functions)?),
            #[cfg(not(all(target_arch = "x86_64", unix)))]
            EngineKind::Compiler => return Err(crate::error::UsageError::EngineUnavailable(engine).into()),
        };

        debug!(
            "compiled {} functions for the {engine} engine{}",
            functions.len(),
            module
                .names
                .as_ref()
                .and_then(|names| names.module_name.as_deref())
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        );
        trace!("native code size: {:?}", code_size(&code));

        Ok(CompiledModule {
            module: module.clone(),
            engine,
            functions,
            code,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// IR of a local function, indexed from the first non-imported function
    pub fn function(&self, local_index: u32) -> Option<&Rc<IrFunction>> {
        self.functions.get(local_index as usize)
    }

    pub fn functions(&self) -> &[Rc<IrFunction>] {
        &self.functions
    }

    pub fn code(&self) -> &CompiledCode {
        &self.code
    }

    /// Bytes of machine code, when compiled natively
    pub fn native_code_size(&self) -> Option<usize> {
        code_size(&self.code)
    }
}

fn code_size(code: &CompiledCode) -> Option<usize> {
    match code {
        CompiledCode::Interpreted => None,
        #[cfg(all(target_arch = "x86_64", unix))]
        CompiledCode::Native(native) => Some(native.code_size()),
    }
}
