mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::store;
use rstest::rstest;
use wasmite::error::UsageError;
use wasmite::host::HostContext;
use wasmite::module::code::CodeBuilder;
use wasmite::module::opcode::*;
use wasmite::module::{
    ConstExpr, Data, Element, ExportIndex, ExternalKind, FunctionType, GlobalType, Limits, Locals, Module, TableType,
    ValueType,
};
use wasmite::runtime::TrapKind;
use wasmite::{Config, EngineKind, Error, HostError, HostFunction, Value};

use ValueType::{I32, I64};

#[rstest]
fn test_hello_runs_once_as_start_function(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    store
        .add_host_function("", "hello", HostFunction::wrap(move || counter.set(counter.get() + 1)))
        .unwrap();

    let mut module = Module::new();
    let ty = module.add_type(FunctionType::new(vec![], vec![]));
    let hello = module.import_function("", "hello", ty);
    module.start = Some(hello);

    store.instantiate_module(&module, "hello").unwrap();
    assert_eq!(calls.get(), 1);
}

#[rstest]
fn test_start_function_runs_before_exports_are_reachable(
    #[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind,
) {
    let Some(mut store) = store(engine) else { return };
    let mut module = Module::new();
    let flag = module.add_global(
        GlobalType {
            value_type: I32,
            mutable: true,
        },
        ConstExpr::I32Const(0),
    );
    let unit = module.add_type(FunctionType::new(vec![], vec![]));
    let getter = module.add_type(FunctionType::new(vec![], vec![I32]));
    // start: flag += 1
    let start = module.add_function(
        unit,
        Locals::empty(),
        CodeBuilder::new()
            .global_get(flag)
            .i32_const(1)
            .op(I32_ADD)
            .global_set(flag)
            .end()
            .finish(),
    );
    let read = module.add_function(getter, Locals::empty(), CodeBuilder::new().global_get(flag).end().finish());
    module.start = Some(start);
    module.export_function("read", read);
    module.export("flag", ExportIndex::Global(flag));

    store.instantiate_module(&module, "m").unwrap();
    assert_eq!(store.global_value("m", "flag").unwrap(), Value::I32(1));
    assert_eq!(store.invoke("m", "read", &[]).unwrap(), vec![Value::I32(1)]);
    assert_eq!(store.invoke("m", "read", &[]).unwrap(), vec![Value::I32(1)]);
}

#[rstest]
fn test_trapping_start_function_fails_instantiation(
    #[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind,
) {
    let Some(mut store) = store(engine) else { return };
    let mut module = Module::new();
    let unit = module.add_type(FunctionType::new(vec![], vec![]));
    let start = module.add_function(unit, Locals::empty(), CodeBuilder::new().unreachable().end().finish());
    module.start = Some(start);
    module.export_function("start", start);

    let err = store.instantiate_module(&module, "m").unwrap_err();
    assert_eq!(err.trap_kind(), Some(TrapKind::Unreachable));
    assert!(store.instance_by_name("m").is_none());
    // The name is free again
    let err = store.instantiate_module(&module, "m").unwrap_err();
    assert_eq!(err.trap_kind(), Some(TrapKind::Unreachable));
}

#[rstest]
#[case::arity(FunctionType::new(vec![I32, I32], vec![I32]))]
#[case::value_kind(FunctionType::new(vec![I64], vec![I32]))]
#[case::result(FunctionType::new(vec![I32], vec![]))]
fn test_host_signature_mismatch_is_a_format_error(#[case] declared: FunctionType) {
    let Some(mut store) = store(EngineKind::Interpreter) else { return };
    store.add_host_function("env", "double", HostFunction::wrap(|x: i32| x * 2)).unwrap();

    let mut module = Module::new();
    let ty = module.add_type(declared);
    module.import_function("env", "double", ty);

    let err = store.instantiate_module(&module, "m").unwrap_err();
    assert!(err.is_format(), "{err}");
    assert!(err.to_string().contains("signature mismatch"), "{err}");
}

#[test]
fn test_unknown_import_is_a_format_error() {
    let mut store = store(EngineKind::Interpreter).unwrap();
    let mut module = Module::new();
    let ty = module.add_type(FunctionType::new(vec![], vec![]));
    module.import_function("env", "missing", ty);

    let err = store.instantiate_module(&module, "m").unwrap_err();
    assert!(err.is_format());
    assert_eq!(err.to_string(), "unknown import env.missing");
}

/// Table of three slots: 0 -> `double` (i32) -> i32, 1 -> `poke` () -> (), 2 empty.
/// `dispatch(arg, slot)` calls through the table as (i32) -> i32.
fn dispatch_module() -> Module {
    let mut module = Module::new();
    let unary = module.add_type(FunctionType::new(vec![I32], vec![I32]));
    let unit = module.add_type(FunctionType::new(vec![], vec![]));
    let binary = module.add_type(FunctionType::new(vec![I32, I32], vec![I32]));
    let poked = module.import_function("env", "poked", unit);

    let double = module.add_function(
        unary,
        Locals::empty(),
        CodeBuilder::new().local_get(0).i32_const(2).op(I32_MUL).end().finish(),
    );
    let poke = module.add_function(unit, Locals::empty(), CodeBuilder::new().call(poked).end().finish());
    let dispatch = module.add_function(
        binary,
        Locals::empty(),
        CodeBuilder::new()
            .local_get(0)
            .local_get(1)
            .call_indirect(unary)
            .end()
            .finish(),
    );
    module.tables.push(TableType {
        limits: Limits::new(3, None),
    });
    module.elements.push(Element {
        table_index: 0,
        offset: ConstExpr::I32Const(0),
        functions: vec![double, poke],
    });
    module.export_function("dispatch", dispatch);
    module
}

#[rstest]
#[case::mismatch(1, TrapKind::IndirectCallSignatureMismatch)]
#[case::empty_slot(2, TrapKind::UninitializedElement)]
#[case::past_the_end(3, TrapKind::UndefinedElement)]
#[case::negative(-1, TrapKind::UndefinedElement)]
fn test_indirect_call_checks(
    #[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind,
    #[case] slot: i32,
    #[case] expected: TrapKind,
) {
    let Some(mut store) = store(engine) else { return };
    let pokes = Rc::new(Cell::new(0));
    let counter = pokes.clone();
    store
        .add_host_function("env", "poked", HostFunction::wrap(move || counter.set(counter.get() + 1)))
        .unwrap();
    store.instantiate_module(&dispatch_module(), "m").unwrap();

    assert_eq!(
        store.invoke("m", "dispatch", &[Value::I32(21), Value::I32(0)]).unwrap(),
        vec![Value::I32(42)]
    );
    let err = store.invoke("m", "dispatch", &[Value::I32(21), Value::I32(slot)]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(expected));
    assert_eq!(pokes.get(), 0, "the mismatched callee must not run");
}

#[rstest]
fn test_host_errors_are_not_traps(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    store
        .add_host_function(
            "env",
            "check",
            HostFunction::wrap(|x: i32| -> Result<i32, HostError> {
                if x < 0 {
                    return Err(HostError::new("negative input"));
                }
                Ok(x + 1)
            }),
        )
        .unwrap();

    let mut module = Module::new();
    let ty = module.add_type(FunctionType::new(vec![I32], vec![I32]));
    let check = module.import_function("env", "check", ty);
    // f(x) = check(x) * 10
    let f = module.add_function(
        ty,
        Locals::empty(),
        CodeBuilder::new()
            .local_get(0)
            .call(check)
            .i32_const(10)
            .op(I32_MUL)
            .end()
            .finish(),
    );
    module.export_function("f", f);
    store.instantiate_module(&module, "m").unwrap();

    assert_eq!(store.invoke("m", "f", &[Value::I32(4)]).unwrap(), vec![Value::I32(50)]);
    let err = store.invoke("m", "f", &[Value::I32(-4)]).unwrap_err();
    assert!(err.is_host(), "{err}");
    assert_eq!(err.trap_kind(), None);
    assert_eq!(err.to_string(), "host function env.check failed: negative input");
}

#[rstest]
fn test_host_functions_see_guest_memory(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    let logged = Rc::new(RefCell::new(Vec::new()));
    let sink = logged.clone();
    let host_log = HostFunction::new(
        FunctionType::new(vec![I32, I32], vec![]),
        move |ctx: &mut HostContext, args: &[Value]| {
            let (address, len) = match args {
                [Value::I32(address), Value::I32(len)] => (*address as u32, *len as usize),
                _ => return Err(HostError::new("bad arguments")),
            };
            sink.borrow_mut().push(String::from_utf8_lossy(&ctx.read_bytes(address, len)?).into_owned());
            ctx.write_bytes(address, b"ok")?;
            Ok(vec![])
        },
    );
    store.add_host_function("env", "log", host_log).unwrap();

    let mut module = Module::new();
    module.memories.push(Limits::new(1, None));
    let log_ty = module.add_type(FunctionType::new(vec![I32, I32], vec![]));
    let f_ty = module.add_type(FunctionType::new(vec![], vec![I32]));
    let log = module.import_function("env", "log", log_ty);
    // f() = log(8, 5); mem16[8]
    let f = module.add_function(
        f_ty,
        Locals::empty(),
        CodeBuilder::new()
            .i32_const(8)
            .i32_const(5)
            .call(log)
            .i32_const(8)
            .memory(I32_LOAD16_U, 1, 0)
            .end()
            .finish(),
    );
    module.export_function("f", f);
    module.data.push(Data {
        memory_index: 0,
        offset: ConstExpr::I32Const(8),
        init: b"hello".to_vec(),
    });
    store.instantiate_module(&module, "m").unwrap();

    assert_eq!(
        store.invoke("m", "f", &[]).unwrap(),
        vec![Value::I32(i32::from(u16::from_le_bytes(*b"ok")))]
    );
    assert_eq!(*logged.borrow(), vec!["hello".to_string()]);
}

/// `lib` exports memory, a constant global and `store(addr, value)`
fn library_module() -> Module {
    let mut module = Module::new();
    module.memories.push(Limits::new(1, None));
    let base = module.add_global(
        GlobalType {
            value_type: I32,
            mutable: false,
        },
        ConstExpr::I32Const(100),
    );
    let ty = module.add_type(FunctionType::new(vec![I32, I32], vec![]));
    let store = module.add_function(
        ty,
        Locals::empty(),
        CodeBuilder::new()
            .local_get(0)
            .local_get(1)
            .memory(I32_STORE, 2, 0)
            .end()
            .finish(),
    );
    module.export_function("store", store);
    module.export("memory", ExportIndex::Memory(0));
    module.export("base", ExportIndex::Global(base));
    module
}

/// `app` imports all of `lib` and exports `run(v)`: stores `v` at `base`, returns `mem[base]`
fn app_module() -> Module {
    let mut module = Module::new();
    let store_ty = module.add_type(FunctionType::new(vec![I32, I32], vec![]));
    let run_ty = module.add_type(FunctionType::new(vec![I32], vec![I32]));
    let store = module.import_function("lib", "store", store_ty);
    module.import("lib", "memory", ExternalKind::Memory(Limits::new(1, None)));
    module.import(
        "lib",
        "base",
        ExternalKind::Global(GlobalType {
            value_type: I32,
            mutable: false,
        }),
    );
    let run = module.add_function(
        run_ty,
        Locals::empty(),
        CodeBuilder::new()
            .global_get(0)
            .local_get(0)
            .call(store)
            .global_get(0)
            .memory(I32_LOAD, 2, 0)
            .end()
            .finish(),
    );
    module.export_function("run", run);
    module
}

#[rstest]
fn test_instances_link_and_share_memory(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    store.instantiate_module(&library_module(), "lib").unwrap();
    store.instantiate_module(&app_module(), "app").unwrap();

    assert_eq!(store.invoke("app", "run", &[Value::I32(77)]).unwrap(), vec![Value::I32(77)]);
    let memory = store.instance_memory("lib", "memory").unwrap();
    assert_eq!(memory.borrow().load::<4>(100, 0).unwrap(), 77u32.to_le_bytes());
}

#[test]
fn test_instances_are_removed_after_their_dependents() {
    let mut store = store(EngineKind::Interpreter).unwrap();
    store.instantiate_module(&library_module(), "lib").unwrap();
    store.instantiate_module(&app_module(), "app").unwrap();

    let err = store.remove_instance("lib").unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::InstanceInUse { .. })), "{err}");

    store.remove_instance("app").unwrap();
    store.remove_instance("lib").unwrap();
    let err = store.invoke("app", "run", &[Value::I32(1)]).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::UnknownInstance(_))), "{err}");

    // Names can be reused, but the new instance gets a fresh id.
    let first = store.instantiate_module(&library_module(), "lib").unwrap();
    store.remove_instance("lib").unwrap();
    let second = store.instantiate_module(&library_module(), "lib").unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_duplicate_registrations_are_rejected() {
    let mut store = store(EngineKind::Interpreter).unwrap();
    store.add_host_function("env", "f", HostFunction::wrap(|| {})).unwrap();
    let err = store.add_host_function("env", "f", HostFunction::wrap(|| {})).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::DuplicateHostFunction { .. })));

    store.instantiate_module(&library_module(), "lib").unwrap();
    let err = store.instantiate_module(&library_module(), "lib").unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::DuplicateInstance(_))));
}

#[test]
fn test_compiled_modules_are_cached_and_engine_bound() {
    let mut interpreter = store(EngineKind::Interpreter).unwrap();
    let module = library_module();
    let compiled = interpreter.compile(&module).unwrap();
    assert!(Rc::ptr_eq(&compiled, &interpreter.compile(&module).unwrap()));
    interpreter.instantiate(&compiled, "a").unwrap();
    interpreter.instantiate(&compiled, "b").unwrap();

    if let Some(mut compiler) = store(EngineKind::Compiler) {
        let err = compiler.instantiate(&compiled, "a").unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::EngineMismatch { .. })), "{err}");
    }
}

#[test]
fn test_config_from_json() {
    let config = Config::from_json(r#"{ "engine": "interpreter", "max_stack_slots": 4096 }"#).unwrap();
    assert_eq!(config.engine, EngineKind::Interpreter);
    assert_eq!(config.max_stack_slots, 4096);
    assert_eq!(config.max_call_depth, Config::default().max_call_depth);

    assert!(Config::from_json(r#"{ "engine": "jit" }"#).is_err());
    assert!(Config::from_json(r#"{ "max_depth": 3 }"#).is_err());
}

#[test]
fn test_oversized_table_fails_instantiation() {
    let mut store = store(EngineKind::Interpreter).unwrap();
    let mut module = Module::new();
    module.tables.push(TableType {
        limits: Limits::new(u32::MAX, None),
    });
    let err = store.instantiate_module(&module, "m").unwrap_err();
    assert!(err.is_format(), "{err}");
    assert!(store.instance_by_name("m").is_none());
}

#[rstest]
fn test_removal_releases_compiled_code(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    let module = library_module();
    let compiled = store.compile(&module).unwrap();
    store.instantiate(&compiled, "a").unwrap();
    store.instantiate(&compiled, "b").unwrap();
    let released = Rc::downgrade(&compiled);
    drop(compiled);

    store.remove_instance("a").unwrap();
    assert!(released.upgrade().is_some(), "still used by b");
    store.remove_instance("b").unwrap();
    assert!(released.upgrade().is_none());
}

#[rstest]
fn test_failed_start_releases_compiled_code(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    let mut module = Module::new();
    let unit = module.add_type(FunctionType::new(vec![], vec![]));
    module.start = Some(module.add_function(unit, Locals::empty(), CodeBuilder::new().unreachable().end().finish()));

    for _ in 0..3 {
        store.instantiate_module(&module, "m").unwrap_err();
    }
    // Only the cache and this handle remain
    assert_eq!(Rc::strong_count(&store.compile(&module).unwrap()), 2);
}

/// Exports a table and `call(i)`, which calls slot `i` as `() -> i32`
fn table_owner_module() -> Module {
    let mut module = Module::new();
    let getter = module.add_type(FunctionType::new(vec![], vec![I32]));
    let call = module.add_type(FunctionType::new(vec![I32], vec![I32]));
    module.tables.push(TableType {
        limits: Limits::new(2, None),
    });
    let f = module.add_function(
        call,
        Locals::empty(),
        CodeBuilder::new().local_get(0).call_indirect(getter).end().finish(),
    );
    module.export_function("call", f);
    module.export("table", ExportIndex::Table(0));
    module
}

/// Imports `owner.table` and places its own `() -> 7` in slot 0
fn table_filler_module() -> Module {
    let mut module = Module::new();
    let getter = module.add_type(FunctionType::new(vec![], vec![I32]));
    module.imports.push(wasmite::module::Import {
        module: "owner".to_string(),
        name: "table".to_string(),
        external_kind: ExternalKind::Table(TableType {
            limits: Limits::new(2, None),
        }),
    });
    let seven = module.add_function(getter, Locals::empty(), CodeBuilder::new().i32_const(7).end().finish());
    module.elements.push(Element {
        table_index: 0,
        offset: ConstExpr::I32Const(0),
        functions: vec![seven],
    });
    module
}

#[rstest]
fn test_removed_functions_left_in_tables_trap(#[values(EngineKind::Interpreter, EngineKind::Compiler)] engine: EngineKind) {
    let Some(mut store) = store(engine) else { return };
    store.instantiate_module(&table_owner_module(), "owner").unwrap();
    store.instantiate_module(&table_filler_module(), "filler").unwrap();
    assert_eq!(store.invoke("owner", "call", &[Value::I32(0)]).unwrap(), vec![Value::I32(7)]);

    store.remove_instance("filler").unwrap();
    let err = store.invoke("owner", "call", &[Value::I32(0)]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(TrapKind::UninitializedElement));
}
