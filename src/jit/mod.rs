//! Compiler engine: ahead-of-time lowering of IR to x86-64
//!
//! A module is lowered function by function into one executable buffer when
//! it is compiled. Invocation allocates a slot buffer sized by
//! [`Config::max_stack_slots`](crate::config::Config), writes the arguments
//! into its first slots and enters native code through [`JitContext`].
//! Native frames nest one per guest call on a `NativeStack` mapped for the
//! invocation, never on the embedder's thread stack.

mod asm;
mod code_memory;
mod codegen;
mod context;
mod stack;

pub use code_memory::CodeMemory;
use stack::NativeStack;

use std::fmt;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{CompileError, Error};
use crate::ir::IrFunction;
use crate::module::Module;
use crate::runtime::{TrapKind, Value};
use crate::store::{FuncAddr, InstanceId, Store};
use context::{JitContext, HOST_ERROR};

/// Native entry point: `(ctx, frame) -> status`
pub(crate) type Entry = unsafe extern "sysv64" fn(*mut JitContext, *mut u64) -> u32;

/// Machine code for every local function of a module
pub struct NativeModule {
    code: CodeMemory,
    /// Offset of each local function's entry
    entries: Vec<usize>,
}

impl NativeModule {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        self.code.bytes()
    }

    pub(crate) fn entry(&self, local_index: u32) -> Entry {
        let address = self.code.address(self.entries[local_index as usize]);
        // SAFETY: every entry offset is the start of a function emitted by `codegen`
        unsafe { std::mem::transmute::<*const u8, Entry>(address) }
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("code", &self.code)
            .field("functions", &self.entries.len())
            .finish()
    }
}

pub fn compile_module(module: &Module, functions: &[Rc<IrFunction>]) -> Result<NativeModule, CompileError> {
    let mut code = Vec::new();
    let mut entries = Vec::with_capacity(functions.len());
    for function in functions {
        while code.len() % 16 != 0 {
            code.push(0xcc);
        }
        entries.push(code.len());
        let bytes = codegen::compile_function(module, function)?;
        trace!(
            "function {}: {} ops, {} bytes\n{}",
            function.index,
            function.ops.len(),
            bytes.len(),
            hex::encode(&bytes)
        );
        code.extend_from_slice(&bytes);
    }

    let code = CodeMemory::new(&code)?;
    debug!("mapped {} bytes of native code for {} functions", code.len(), entries.len());
    Ok(NativeModule { code, entries })
}

/// Run guest function `addr` to completion
pub(crate) fn invoke(store: &Store, caller: InstanceId, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Error> {
    let native_stack = NativeStack::for_depth(store.config().max_call_depth).map_err(CompileError::from)?;
    invoke_on(&native_stack, store, caller, addr, args)
}

fn invoke_on(
    native_stack: &NativeStack,
    store: &Store,
    caller: InstanceId,
    addr: FuncAddr,
    args: &[Value],
) -> Result<Vec<Value>, Error> {
    let ty = store.function(addr).ty().clone();
    let slots = store.config().max_stack_slots;
    let mut stack = vec![0u64; slots.max(args.len()).max(ty.return_types.len())];
    for (slot, arg) in stack.iter_mut().zip(args) {
        *slot = arg.to_bits();
    }

    let base = stack.as_mut_ptr();
    let mut ctx = JitContext::new(store, caller, base.wrapping_add(slots), native_stack.limit());
    // SAFETY: `stack` and `ctx` outlive the call and the arguments are in the first slots.
    let status = unsafe { native_stack.run(&mut ctx, base, addr.0, context::jit_enter) }.map_err(CompileError::from)?;

    match status {
        0 => Ok(ty
            .return_types
            .iter()
            .zip(&stack)
            .map(|(ty, bits)| Value::from_bits(*ty, *bits))
            .collect()),
        HOST_ERROR => Err(ctx.take_error().unwrap_or_else(|| TrapKind::Unreachable.into())),
        code => {
            let kind = TrapKind::from_code(code).unwrap_or(TrapKind::Unreachable);
            trace!("native code trapped: {kind}");
            Err(kind.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineKind;
    use crate::module::code::CodeBuilder;
    use crate::module::opcode::*;
    use crate::module::{FunctionType, Limits, Locals, ValueType};

    use ValueType::{F32, F64, I32, I64};

    fn store() -> Store {
        Store::with_config(Config::default().with_engine(EngineKind::Compiler)).unwrap()
    }

    /// One exported function `f` in a module with a single page of memory
    fn run(params: Vec<ValueType>, results: Vec<ValueType>, locals: Locals, body: CodeBuilder, args: &[Value]) -> Result<Vec<Value>, Error> {
        let mut module = Module::new();
        module.memories.push(Limits::new(1, Some(2)));
        let ty = module.add_type(FunctionType::new(params, results));
        let f = module.add_function(ty, locals, body.end().finish());
        module.export_function("f", f);

        let mut store = store();
        store.instantiate_module(&module, "m")?;
        store.invoke("m", "f", args)
    }

    fn result_type(opcode: u8) -> ValueType {
        crate::ir::NumericOp::from_opcode(opcode)
            .map(|op| op.signature().1)
            .unwrap_or(I32)
    }

    fn unary(ty: ValueType, opcode: u8, a: Value) -> Result<Vec<Value>, Error> {
        let body = CodeBuilder::new().local_get(0).op(opcode);
        run(vec![ty], vec![result_type(opcode)], Locals::empty(), body, &[a])
    }

    fn binary(ty: ValueType, opcode: u8, a: Value, b: Value) -> Result<Vec<Value>, Error> {
        let body = CodeBuilder::new().local_get(0).local_get(1).op(opcode);
        run(vec![ty, ty], vec![result_type(opcode)], Locals::empty(), body, &[a, b])
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(binary(I32, I32_ADD, Value::I32(i32::MAX), Value::I32(1)).unwrap(), vec![Value::I32(i32::MIN)]);
        assert_eq!(binary(I32, I32_SUB, Value::I32(3), Value::I32(5)).unwrap(), vec![Value::I32(-2)]);
        assert_eq!(binary(I64, I64_MUL, Value::I64(-4), Value::I64(1 << 40)).unwrap(), vec![Value::I64(-(1 << 42))]);
        assert_eq!(binary(I32, I32_SHL, Value::I32(1), Value::I32(33)).unwrap(), vec![Value::I32(2)]);
        assert_eq!(binary(I32, I32_SHR_S, Value::I32(-8), Value::I32(1)).unwrap(), vec![Value::I32(-4)]);
        assert_eq!(binary(I32, I32_SHR_U, Value::I32(-8), Value::I32(1)).unwrap(), vec![Value::I32(0x7fff_fffc)]);
        assert_eq!(binary(I64, I64_ROTL, Value::I64(i64::MIN), Value::I64(1)).unwrap(), vec![Value::I64(1)]);
        assert_eq!(binary(I32, I32_LT_U, Value::I32(-1), Value::I32(1)).unwrap(), vec![Value::I32(0)]);
        assert_eq!(binary(I64, I64_LT_S, Value::I64(-1), Value::I64(1)).unwrap(), vec![Value::I32(1)]);
    }

    #[test]
    fn test_division() {
        assert_eq!(binary(I32, I32_DIV_S, Value::I32(-7), Value::I32(2)).unwrap(), vec![Value::I32(-3)]);
        assert_eq!(binary(I32, I32_REM_S, Value::I32(-7), Value::I32(2)).unwrap(), vec![Value::I32(-1)]);
        assert_eq!(binary(I32, I32_DIV_U, Value::I32(-1), Value::I32(2)).unwrap(), vec![Value::I32(0x7fff_ffff)]);
        assert_eq!(binary(I64, I64_REM_U, Value::I64(10), Value::I64(3)).unwrap(), vec![Value::I64(1)]);
        assert_eq!(binary(I32, I32_REM_S, Value::I32(i32::MIN), Value::I32(-1)).unwrap(), vec![Value::I32(0)]);
        assert_eq!(binary(I64, I64_DIV_S, Value::I64(5), Value::I64(-1)).unwrap(), vec![Value::I64(-5)]);

        let err = binary(I32, I32_DIV_U, Value::I32(1), Value::I32(0)).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::IntegerDivideByZero));
        let err = binary(I64, I64_DIV_S, Value::I64(i64::MIN), Value::I64(-1)).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::IntegerOverflow));
        let err = binary(I32, I32_DIV_S, Value::I32(i32::MIN), Value::I32(-1)).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::IntegerOverflow));
    }

    #[test]
    fn test_float_ops() {
        let nan = Value::F32(f32::NAN);
        assert_eq!(binary(F32, F32_EQ, nan, nan).unwrap(), vec![Value::I32(0)]);
        assert_eq!(binary(F32, F32_NE, nan, nan).unwrap(), vec![Value::I32(1)]);
        assert_eq!(binary(F64, F64_LT, Value::F64(1.0), Value::F64(2.0)).unwrap(), vec![Value::I32(1)]);
        assert_eq!(binary(F64, F64_GE, Value::F64(1.0), Value::F64(f64::NAN)).unwrap(), vec![Value::I32(0)]);
        assert_eq!(binary(F64, F64_LE, Value::F64(2.0), Value::F64(2.0)).unwrap(), vec![Value::I32(1)]);
        assert_eq!(binary(F32, F32_ADD, Value::F32(1.5), Value::F32(2.25)).unwrap(), vec![Value::F32(3.75)]);
        assert_eq!(
            binary(F64, F64_COPYSIGN, Value::F64(3.0), Value::F64(-0.0)).unwrap(),
            vec![Value::F64(-3.0)]
        );

        assert_eq!(unary(F32, F32_NEG, Value::F32(2.0)).unwrap(), vec![Value::F32(-2.0)]);
        assert_eq!(unary(F64, F64_ABS, Value::F64(-0.5)).unwrap(), vec![Value::F64(0.5)]);
        assert_eq!(unary(F64, F64_SQRT, Value::F64(9.0)).unwrap(), vec![Value::F64(3.0)]);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(unary(I32, I64_EXTEND_I32_S, Value::I32(-1)).unwrap(), vec![Value::I64(-1)]);
        assert_eq!(unary(I32, I64_EXTEND_I32_U, Value::I32(-1)).unwrap(), vec![Value::I64(0xffff_ffff)]);
        assert_eq!(unary(I64, I32_WRAP_I64, Value::I64(0x1_0000_0005)).unwrap(), vec![Value::I32(5)]);
        assert_eq!(unary(I32, I32_EQZ, Value::I32(0)).unwrap(), vec![Value::I32(1)]);
        assert_eq!(
            unary(F32, I32_REINTERPRET_F32, Value::F32(-0.0)).unwrap(),
            vec![Value::I32(i32::MIN)]
        );

        let err = unary(F64, I32_TRUNC_F64_S, Value::F64(f64::NAN)).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::InvalidConversionToInteger));
    }

    #[test]
    fn test_loop_with_locals() {
        // sum = 0; i = n; loop { sum += i; i -= 1; br_if i }
        let body = CodeBuilder::new()
            .loop_(None)
            .local_get(1)
            .local_get(0)
            .op(I32_ADD)
            .local_set(1)
            .local_get(0)
            .i32_const(1)
            .op(I32_SUB)
            .local_tee(0)
            .br_if(0)
            .end()
            .local_get(1);
        let result = run(vec![I32], vec![I32], Locals::new(vec![(1, I32)]), body, &[Value::I32(100)]).unwrap();
        assert_eq!(result, vec![Value::I32(5050)]);
    }

    #[test]
    fn test_block_results_and_br_table() {
        let body = CodeBuilder::new()
            .block(Some(I32))
            .block(Some(I32))
            .i32_const(10)
            .local_get(0)
            .br_table(&[0], 1)
            .end()
            .drop()
            .i32_const(20)
            .end();
        for (index, expected) in [(0, 20), (1, 10), (5, 10)] {
            let result = run(vec![I32], vec![I32], Locals::empty(), body.clone(), &[Value::I32(index)]).unwrap();
            assert_eq!(result, vec![Value::I32(expected)], "index {index}");
        }
    }

    #[test]
    fn test_memory_access() {
        let body = CodeBuilder::new()
            .local_get(0)
            .i64_const(-2)
            .memory(I64_STORE16, 1, 2)
            .local_get(0)
            .memory(I64_LOAD16_S, 1, 2);
        let result = run(vec![I32], vec![I64], Locals::empty(), body.clone(), &[Value::I32(100)]).unwrap();
        assert_eq!(result, vec![Value::I64(-2)]);

        let err = run(vec![I32], vec![I64], Locals::empty(), body.clone(), &[Value::I32(65533)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::OutOfBoundsMemoryAccess));
        let err = run(vec![I32], vec![I64], Locals::empty(), body, &[Value::I32(-1)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn test_memory_grow_moves_base() {
        // grow by one page, then write to and read from the new page
        let body = CodeBuilder::new()
            .i32_const(1)
            .memory_grow()
            .drop()
            .i32_const(70000)
            .i32_const(7)
            .memory(I32_STORE, 2, 0)
            .memory_size()
            .i32_const(70000)
            .memory(I32_LOAD, 2, 0)
            .op(I32_ADD);
        let result = run(vec![], vec![I32], Locals::empty(), body, &[]).unwrap();
        assert_eq!(result, vec![Value::I32(9)]);
    }

    #[test]
    fn test_recursion_and_depth_limit() {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![I32], vec![I32]));
        // fac(n) = n == 0 ? 1 : n * fac(n - 1)
        let fac = module.add_function(
            ty,
            Locals::empty(),
            CodeBuilder::new()
                .local_get(0)
                .op(I32_EQZ)
                .if_(Some(I32))
                .i32_const(1)
                .else_()
                .local_get(0)
                .local_get(0)
                .i32_const(1)
                .op(I32_SUB)
                .call(0)
                .op(I32_MUL)
                .end()
                .end()
                .finish(),
        );
        module.export_function("fac", fac);

        let config = Config::default().with_engine(EngineKind::Compiler).with_max_call_depth(32);
        let mut store = Store::with_config(config).unwrap();
        store.instantiate_module(&module, "m").unwrap();
        assert_eq!(store.invoke("m", "fac", &[Value::I32(10)]).unwrap(), vec![Value::I32(3628800)]);
        let err = store.invoke("m", "fac", &[Value::I32(40)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::CallStackExhausted));
        assert_eq!(store.invoke("m", "fac", &[Value::I32(5)]).unwrap(), vec![Value::I32(120)]);
    }

    #[test]
    fn test_native_stack_exhaustion_traps() {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![I32], vec![I32]));
        // f(n) = n == 0 ? 0 : f(n - 1) + 1
        let f = module.add_function(
            ty,
            Locals::empty(),
            CodeBuilder::new()
                .local_get(0)
                .op(I32_EQZ)
                .if_(Some(I32))
                .i32_const(0)
                .else_()
                .local_get(0)
                .i32_const(1)
                .op(I32_SUB)
                .call(0)
                .i32_const(1)
                .op(I32_ADD)
                .end()
                .end()
                .finish(),
        );
        module.export_function("f", f);

        let config = Config::default()
            .with_engine(EngineKind::Compiler)
            .with_max_call_depth(usize::MAX)
            .with_max_stack_slots(1 << 20);
        let mut store = Store::with_config(config).unwrap();
        let id = store.instantiate_module(&module, "m").unwrap();
        let Some(crate::store::Extern::Function(addr)) = store.instance(id).and_then(|m| m.export("f")).cloned() else {
            panic!("f is not exported");
        };

        // Far less native stack than the depth limit would need
        let native_stack = NativeStack::new(stack::STACK_RESERVE + 64 * 1024).unwrap();
        let err = invoke_on(&native_stack, &store, id, addr, &[Value::I32(1_000_000)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::CallStackExhausted));
        let result = invoke_on(&native_stack, &store, id, addr, &[Value::I32(10)]).unwrap();
        assert_eq!(result, vec![Value::I32(10)]);
    }

    #[test]
    fn test_code_is_mapped() {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![I32]));
        module.add_function(ty, Locals::empty(), CodeBuilder::new().i32_const(1).end().finish());
        module.add_function(ty, Locals::empty(), CodeBuilder::new().i32_const(2).end().finish());

        let mut store = store();
        let compiled = store.compile(&module).unwrap();
        let size = compiled.native_code_size().unwrap();
        assert!(size > 16, "{size}");
    }
}
