//! State shared between native code and the runtime
//!
//! Generated code reads the memory base and length straight out of
//! [`JitContext`] and calls back into the `jit_*` helpers for everything it
//! does not inline: calls, globals, `memory.grow` and the heavier numeric ops.
//! Helpers return zero on success, otherwise a status the caller's native code
//! propagates unchanged to [`super::invoke`].

use std::ptr;

use crate::engine::CompiledCode;
use crate::error::Error;
use crate::ir::NumericOp;
use crate::runtime::{ops, TrapKind, Value};
use crate::store::{FuncAddr, FunctionInstance, InstanceId, Store};

/// Status for a failed host function; the error itself is kept in the context
pub const HOST_ERROR: u32 = 0x100;

pub const MEMORY_BASE_OFFSET: u8 = 0;
pub const MEMORY_LEN_OFFSET: u8 = 8;

#[repr(C)]
pub struct JitContext {
    /// Base of the running instance's memory, null without one
    memory_base: *mut u8,
    memory_len: u64,
    store: *const Store,
    instance: InstanceId,
    depth: usize,
    max_depth: usize,
    /// One past the last usable frame slot
    stack_end: *const u64,
    /// Native stack address below which no further call is entered
    stack_limit: usize,
    error: Option<Error>,
}

impl JitContext {
    pub(super) fn new(store: &Store, instance: InstanceId, stack_end: *const u64, stack_limit: usize) -> Self {
        let mut ctx = JitContext {
            memory_base: ptr::null_mut(),
            memory_len: 0,
            store,
            instance,
            depth: 0,
            max_depth: store.config().max_call_depth,
            stack_end,
            stack_limit,
            error: None,
        };
        ctx.refresh_memory();
        ctx
    }

    pub(super) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Reload the memory pointer, which moves when memory grows
    fn refresh_memory(&mut self) {
        // SAFETY: the store outlives every invocation that uses this context.
        let store = unsafe { &*self.store };
        match store.instance(self.instance).and_then(|instance| instance.memory()) {
            Some(memory) => {
                let mut memory = memory.borrow_mut();
                self.memory_base = memory.data_ptr();
                self.memory_len = memory.len() as u64;
            }
            None => {
                self.memory_base = ptr::null_mut();
                self.memory_len = 0;
            }
        }
    }

    /// Run `addr` with its arguments in `frame[0..params]`, leaving results in
    /// `frame[0..results]`.
    ///
    /// # Safety
    ///
    /// `frame` must point into the invocation's slot buffer, and the callee's
    /// arguments must already be in place.
    pub(super) unsafe fn call(&mut self, addr: FuncAddr, frame: *mut u64) -> u32 {
        let marker = 0u8;
        if (ptr::addr_of!(marker) as usize) < self.stack_limit {
            return TrapKind::CallStackExhausted.code();
        }
        let store = &*self.store;
        match store.function(addr) {
            FunctionInstance::Guest {
                instance,
                module,
                index,
                ..
            } => {
                if store.instance(*instance).is_none() {
                    return TrapKind::UninitializedElement.code();
                }
                let (Some(function), CompiledCode::Native(native)) = (module.function(*index), module.code()) else {
                    unreachable!("store only holds natively compiled modules");
                };
                if self.depth >= self.max_depth
                    || frame as usize + function.frame_slots() * std::mem::size_of::<u64>() > self.stack_end as usize
                {
                    return TrapKind::CallStackExhausted.code();
                }

                let caller = std::mem::replace(&mut self.instance, *instance);
                if caller != *instance {
                    self.refresh_memory();
                }
                self.depth += 1;
                let status = (native.entry(*index))(self, frame);
                self.depth -= 1;
                self.instance = caller;
                self.refresh_memory();
                status
            }
            FunctionInstance::Host(host) => {
                let args = host
                    .ty()
                    .parameters
                    .iter()
                    .enumerate()
                    .map(|(i, ty)| Value::from_bits(*ty, *frame.add(i)))
                    .collect::<Vec<_>>();
                match host.invoke(store.memory_of(self.instance), &args) {
                    Ok(results) => {
                        for (i, value) in results.iter().enumerate() {
                            *frame.add(i) = value.to_bits();
                        }
                        self.refresh_memory();
                        0
                    }
                    Err(err) => {
                        self.error = Some(err);
                        HOST_ERROR
                    }
                }
            }
            FunctionInstance::Removed(_) => TrapKind::UninitializedElement.code(),
        }
    }
}

/// First call of an invocation, entered on its native stack
pub(super) unsafe extern "sysv64" fn jit_enter(ctx: *mut JitContext, frame: *mut u64, addr: usize) -> u32 {
    (*ctx).call(FuncAddr(addr), frame)
}

pub(super) unsafe extern "sysv64" fn jit_call(ctx: *mut JitContext, function: u32, frame: *mut u64) -> u32 {
    let ctx = &mut *ctx;
    let store = &*ctx.store;
    match store.instance(ctx.instance) {
        Some(instance) => ctx.call(instance.function(function), frame),
        None => TrapKind::UninitializedElement.code(),
    }
}

pub(super) unsafe extern "sysv64" fn jit_call_indirect(
    ctx: *mut JitContext,
    type_index: u32,
    frame: *mut u64,
    element: u32,
) -> u32 {
    let ctx = &mut *ctx;
    let store = &*ctx.store;
    let Some(instance) = store.instance(ctx.instance) else {
        return TrapKind::UninitializedElement.code();
    };
    let Some(table) = instance.table() else {
        return TrapKind::UndefinedElement.code();
    };
    let addr = match table.borrow().get(element) {
        Ok(addr) => addr,
        Err(kind) => return kind.code(),
    };
    let expected = &instance.module().module().types[type_index as usize];
    if store.function(addr).ty() != expected {
        return TrapKind::IndirectCallSignatureMismatch.code();
    }
    ctx.call(addr, frame)
}

pub(super) unsafe extern "sysv64" fn jit_global_get(ctx: *mut JitContext, global: u32, slot: *mut u64) -> u32 {
    let ctx = &*ctx;
    match (*ctx.store).instance(ctx.instance) {
        Some(instance) => {
            *slot = instance.global(global).get().to_bits();
            0
        }
        None => TrapKind::UninitializedElement.code(),
    }
}

pub(super) unsafe extern "sysv64" fn jit_global_set(ctx: *mut JitContext, global: u32, slot: *mut u64) -> u32 {
    let ctx = &*ctx;
    match (*ctx.store).instance(ctx.instance) {
        Some(instance) => {
            let global = instance.global(global);
            global.set(Value::from_bits(global.global_type().value_type, *slot));
            0
        }
        None => TrapKind::UninitializedElement.code(),
    }
}

/// Grow by the page count in `slot`, replacing it with the previous size or -1
pub(super) unsafe extern "sysv64" fn jit_memory_grow(ctx: *mut JitContext, _: u32, slot: *mut u64) -> u32 {
    let ctx = &mut *ctx;
    let previous = match (*ctx.store).memory_of(ctx.instance) {
        Some(memory) => memory.borrow_mut().grow(*slot as u32),
        None => -1,
    };
    *slot = Value::I32(previous).to_bits();
    ctx.refresh_memory();
    0
}

/// Evaluate a numeric op over the operands starting at `slot`, writing the
/// result back to `slot`
pub(super) unsafe extern "sysv64" fn jit_numeric(_: *mut JitContext, opcode: u32, slot: *mut u64) -> u32 {
    let Some(op) = NumericOp::from_opcode(opcode as u8) else {
        return TrapKind::Unreachable.code();
    };
    let (params, _) = op.signature();
    let mut operands = [Value::I32(0); 2];
    for (i, ty) in params.iter().enumerate() {
        operands[i] = Value::from_bits(*ty, *slot.add(i));
    }
    match ops::eval(op, &operands[..params.len()]) {
        Ok(value) => {
            *slot = value.to_bits();
            0
        }
        Err(kind) => kind.code(),
    }
}
