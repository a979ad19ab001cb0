//! Fixtures shared between integration tests

#![allow(dead_code)]

use wasmite::module::code::CodeBuilder;
use wasmite::module::{FunctionType, Limits, Locals, Module, ValueType};
use wasmite::{Config, EngineKind, Error, Store, Value};

/// A store on `engine`, or `None` when this host cannot run it
pub fn store(engine: EngineKind) -> Option<Store> {
    store_with(Config::default().with_engine(engine))
}

pub fn store_with(config: Config) -> Option<Store> {
    if !config.engine.is_available() {
        return None;
    }
    Some(Store::with_config(config).unwrap())
}

/// A module with one page of memory exporting a single function `f`
pub fn function_module(params: Vec<ValueType>, results: Vec<ValueType>, locals: Locals, body: CodeBuilder) -> Module {
    let mut module = Module::new();
    module.memories.push(Limits::new(1, Some(4)));
    let ty = module.add_type(FunctionType::new(params, results));
    let f = module.add_function(ty, locals, body.end().finish());
    module.export_function("f", f);
    module
}

/// What an invocation produced, comparable across engines bit for bit
pub type Outcome = Result<Vec<(ValueType, u64)>, String>;

pub fn outcome(result: Result<Vec<Value>, Error>) -> Outcome {
    match result {
        Ok(values) => Ok(values.iter().map(|v| (v.typ(), v.to_bits())).collect()),
        Err(err) => Err(match err.trap_kind() {
            Some(kind) => format!("trap: {kind}"),
            None => err.to_string(),
        }),
    }
}
