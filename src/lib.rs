//! A WebAssembly MVP loader and execution engine written in Rust.
//!
//! wasmite takes an already-decoded [`module::Module`], validates it and lowers
//! every function to a flat intermediate representation, then executes it with
//! one of two engines: a portable interpreter or, on x86-64 unix hosts, a
//! compiler that emits native machine code. Both engines share the same
//! runtime objects and produce bit-identical results and traps.
//!
//! # Modules
//!
//! - [`module`] -- Module description and [`module::code::CodeBuilder`] for encoding function bodies.
//! - [`ir`] -- Validation and lowering of function bodies to a flat IR.
//! - [`store`] -- Compilation, instantiation, import linking and invocation.
//! - [`interpreter`] -- Executes IR directly on an explicit value stack.
//! - `jit` -- x86-64 code generation (only on x86-64 unix).
//! - [`host`] -- Rust functions importable by guest modules.
//! - [`runtime`] -- Values, memory, tables, globals, traps and the numeric kernel.
//!
//! # Example
//!
//! Build a module, instantiate it, and call an exported function:
//!
//! ```
//! use wasmite::module::code::CodeBuilder;
//! use wasmite::module::{opcode, FunctionType, Locals, Module, ValueType};
//! use wasmite::{Store, Value};
//!
//! let mut module = Module::new();
//! let ty = module.add_type(FunctionType::new(vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]));
//! let body = CodeBuilder::new().local_get(0).local_get(1).op(opcode::I32_ADD).end().finish();
//! let add = module.add_function(ty, Locals::empty(), body);
//! module.export_function("add", add);
//!
//! let mut store = Store::new();
//! store.instantiate_module(&module, "math").unwrap();
//! let results = store.invoke("math", "add", &[Value::I32(2), Value::I32(3)]).unwrap();
//! assert_eq!(results, vec![Value::I32(5)]);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod ir;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod jit;
pub mod module;
pub mod runtime;
pub mod store;

pub use config::Config;
pub use engine::EngineKind;
pub use error::Error;
pub use host::{HostError, HostFunction};
pub use module::Module;
pub use runtime::Value;
pub use store::Store;
