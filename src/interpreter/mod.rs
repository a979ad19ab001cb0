//! IR interpreter
//!
//! Guest calls never recurse on the host stack: a call pushes a [`Frame`] and
//! the dispatch loop picks up the new top frame, a return pops it and resumes
//! the caller at its saved pc. Locals and operands of every active frame live
//! in one [`Stack`]; a branch keeps its carried values, drops everything above
//! the target height and jumps.

mod frame;

use std::rc::Rc;

pub use frame::Frame;

use crate::error::Error;
use crate::ir::{BranchTarget, LoadKind, Operation, StoreKind};
use crate::runtime::{ops, Memory, SharedMemory, Stack, TrapKind, Value};
use crate::store::{FuncAddr, FunctionInstance, ModuleInstance, Store};

pub struct Interpreter<'s> {
    store: &'s Store,
    stack: Stack,
    frames: Vec<Frame<'s>>,
    max_call_depth: usize,
    max_stack_slots: usize,
}

impl<'s> Interpreter<'s> {
    pub fn new(store: &'s Store) -> Self {
        let config = store.config();
        Interpreter {
            store,
            stack: Stack::with_capacity(config.max_stack_slots.min(1024)),
            frames: Vec::new(),
            max_call_depth: config.max_call_depth,
            max_stack_slots: config.max_stack_slots,
        }
    }

    /// Run `addr` to completion; the caller has checked `args` against its type
    pub fn call(&mut self, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Error> {
        let result_count = self.store.function(addr).ty().return_types.len();
        let depth = self.frames.len();

        self.stack.push_all(args.iter().copied());
        self.enter(addr, None)?;
        self.run(depth)?;

        Ok(self.stack.split_off(self.stack.len() - result_count))
    }

    /// Start a call whose arguments are on top of the stack.
    ///
    /// Guest functions get a new frame; host functions run immediately and
    /// leave their results in place of the arguments.
    fn enter(&mut self, addr: FuncAddr, caller: Option<&'s ModuleInstance>) -> Result<(), Error> {
        let store = self.store;
        match store.function(addr) {
            FunctionInstance::Guest { instance, module, index, .. } => {
                let instance = store.instance(*instance).ok_or(TrapKind::UninitializedElement)?;
                let function = module.function(*index).cloned().ok_or(TrapKind::UninitializedElement)?;

                if self.frames.len() >= self.max_call_depth {
                    return Err(TrapKind::CallStackExhausted.into());
                }
                let base = self.stack.len() - function.param_count();
                if base + function.frame_slots() > self.max_stack_slots {
                    return Err(TrapKind::CallStackExhausted.into());
                }

                for ty in &function.locals[function.param_count()..] {
                    self.stack.push(Value::default_for(*ty));
                }
                self.frames.push(Frame {
                    function,
                    instance,
                    pc: 0,
                    base,
                });
                Ok(())
            }
            FunctionInstance::Host(host) => {
                let args = self.stack.split_off(self.stack.len() - host.ty().parameters.len());
                let memory = caller.and_then(|instance| instance.memory.clone());
                let results = host.invoke(memory, &args)?;
                self.stack.push_all(results);
                Ok(())
            }
            FunctionInstance::Removed(_) => Err(TrapKind::UninitializedElement.into()),
        }
    }

    /// Execute until the frame stack is back to `stop` frames
    fn run(&mut self, stop: usize) -> Result<(), Error> {
        'frames: while self.frames.len() > stop {
            let Some(frame) = self.frames.last() else {
                break;
            };
            let function = Rc::clone(&frame.function);
            let instance = frame.instance;
            let base = frame.base;
            let operands = frame.operand_base();
            let mut pc = frame.pc;

            loop {
                let instr = &function.ops[pc];
                pc += 1;

                match &instr.op {
                    Operation::Unreachable => return Err(TrapKind::Unreachable.into()),
                    Operation::Br(target) => pc = self.branch(operands, target),
                    Operation::BrIf(target) => {
                        if self.stack.pop_i32() != 0 {
                            pc = self.branch(operands, target);
                        }
                    }
                    Operation::BrUnless(target) => {
                        if self.stack.pop_i32() == 0 {
                            pc = self.branch(operands, target);
                        }
                    }
                    Operation::BrTable { targets, default } => {
                        let index = self.stack.pop_i32() as u32 as usize;
                        pc = self.branch(operands, targets.get(index).unwrap_or(default));
                    }
                    Operation::Return => {
                        self.stack.unwind(base, function.result_count());
                        self.frames.pop();
                        continue 'frames;
                    }
                    Operation::Call(index) => {
                        self.suspend(pc);
                        self.enter(instance.function(*index), Some(instance))?;
                        continue 'frames;
                    }
                    Operation::CallIndirect(type_index) => {
                        let element = self.stack.pop_i32() as u32;
                        let table = instance.table.as_ref().ok_or(TrapKind::UndefinedElement)?;
                        let addr = table.borrow().get(element)?;
                        let expected = &instance.module.module().types[*type_index as usize];
                        if self.store.function(addr).ty() != expected {
                            return Err(TrapKind::IndirectCallSignatureMismatch.into());
                        }
                        self.suspend(pc);
                        self.enter(addr, Some(instance))?;
                        continue 'frames;
                    }
                    Operation::Drop(_) => {
                        self.stack.pop();
                    }
                    Operation::Select(_) => {
                        let condition = self.stack.pop_i32();
                        let second = self.stack.pop();
                        let first = self.stack.pop();
                        self.stack.push(if condition != 0 { first } else { second });
                    }
                    Operation::LocalGet(index) => {
                        let value = self.stack.get(base + *index as usize);
                        self.stack.push(value);
                    }
                    Operation::LocalSet(index) => {
                        let value = self.stack.pop();
                        self.stack.set(base + *index as usize, value);
                    }
                    Operation::LocalTee(index) => {
                        let value = self.stack.get(self.stack.len() - 1);
                        self.stack.set(base + *index as usize, value);
                    }
                    Operation::GlobalGet(index) => self.stack.push(instance.global(*index).get()),
                    Operation::GlobalSet(index) => {
                        let value = self.stack.pop();
                        instance.global(*index).set(value);
                    }
                    Operation::Load { kind, offset } => {
                        let address = self.stack.pop_i32() as u32;
                        let value = load(&memory(instance)?.borrow(), *kind, address, *offset)?;
                        self.stack.push(value);
                    }
                    Operation::Store { kind, offset } => {
                        let value = self.stack.pop();
                        let address = self.stack.pop_i32() as u32;
                        store(&mut memory(instance)?.borrow_mut(), *kind, address, *offset, value)?;
                    }
                    Operation::MemorySize => {
                        let pages = memory(instance)?.borrow().size();
                        self.stack.push(Value::I32(pages as i32));
                    }
                    Operation::MemoryGrow => {
                        let delta = self.stack.pop_i32() as u32;
                        let previous = memory(instance)?.borrow_mut().grow(delta);
                        self.stack.push(Value::I32(previous));
                    }
                    Operation::Const(value) => self.stack.push(*value),
                    Operation::Numeric(op) => {
                        let arity = op.arity();
                        let start = self.stack.len() - arity;
                        let result = ops::eval(*op, self.stack.top(arity))?;
                        self.stack.truncate(start);
                        self.stack.push(result);
                    }
                }
            }
        }
        Ok(())
    }

    /// Keep `target.arity` values, drop the rest above the target height, return the new pc
    fn branch(&mut self, operands: usize, target: &BranchTarget) -> usize {
        self.stack.unwind(operands + target.height as usize, target.arity as usize);
        target.pc
    }

    /// Save the resume point of the current frame before a call
    fn suspend(&mut self, pc: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }
}

fn memory(instance: &ModuleInstance) -> Result<&SharedMemory, TrapKind> {
    instance.memory.as_ref().ok_or(TrapKind::OutOfBoundsMemoryAccess)
}

fn load(memory: &Memory, kind: LoadKind, address: u32, offset: u32) -> Result<Value, TrapKind> {
    Ok(match kind {
        LoadKind::I32 => Value::I32(i32::from_le_bytes(memory.load(address, offset)?)),
        LoadKind::I64 => Value::I64(i64::from_le_bytes(memory.load(address, offset)?)),
        LoadKind::F32 => Value::F32(f32::from_le_bytes(memory.load(address, offset)?)),
        LoadKind::F64 => Value::F64(f64::from_le_bytes(memory.load(address, offset)?)),
        LoadKind::I32S8 => Value::I32(i8::from_le_bytes(memory.load(address, offset)?) as i32),
        LoadKind::I32U8 => Value::I32(u8::from_le_bytes(memory.load(address, offset)?) as i32),
        LoadKind::I32S16 => Value::I32(i16::from_le_bytes(memory.load(address, offset)?) as i32),
        LoadKind::I32U16 => Value::I32(u16::from_le_bytes(memory.load(address, offset)?) as i32),
        LoadKind::I64S8 => Value::I64(i8::from_le_bytes(memory.load(address, offset)?) as i64),
        LoadKind::I64U8 => Value::I64(u8::from_le_bytes(memory.load(address, offset)?) as i64),
        LoadKind::I64S16 => Value::I64(i16::from_le_bytes(memory.load(address, offset)?) as i64),
        LoadKind::I64U16 => Value::I64(u16::from_le_bytes(memory.load(address, offset)?) as i64),
        LoadKind::I64S32 => Value::I64(i32::from_le_bytes(memory.load(address, offset)?) as i64),
        LoadKind::I64U32 => Value::I64(u32::from_le_bytes(memory.load(address, offset)?) as i64),
    })
}

fn store(memory: &mut Memory, kind: StoreKind, address: u32, offset: u32, value: Value) -> Result<(), TrapKind> {
    match (kind, value) {
        (StoreKind::I32, Value::I32(v)) => memory.store(address, offset, v.to_le_bytes()),
        (StoreKind::I64, Value::I64(v)) => memory.store(address, offset, v.to_le_bytes()),
        (StoreKind::F32, Value::F32(v)) => memory.store(address, offset, v.to_le_bytes()),
        (StoreKind::F64, Value::F64(v)) => memory.store(address, offset, v.to_le_bytes()),
        (StoreKind::I32As8, Value::I32(v)) => memory.store(address, offset, (v as u8).to_le_bytes()),
        (StoreKind::I32As16, Value::I32(v)) => memory.store(address, offset, (v as u16).to_le_bytes()),
        (StoreKind::I64As8, Value::I64(v)) => memory.store(address, offset, (v as u8).to_le_bytes()),
        (StoreKind::I64As16, Value::I64(v)) => memory.store(address, offset, (v as u16).to_le_bytes()),
        (StoreKind::I64As32, Value::I64(v)) => memory.store(address, offset, (v as u32).to_le_bytes()),
        (kind, value) => unreachable!("{kind:?} of {value:?} passed validation"),
    }
}
