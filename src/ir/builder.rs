//! Validation and lowering of function bodies to IR
//!
//! A single forward pass over the instruction bytes keeps two stacks: the
//! operand *types* and the open control frames. Each control frame is an entry
//! in a `Vec` addressed by index, and a label depth `d` resolves to the frame at
//! `len - 1 - d`. Backward branches (to a `loop`) resolve immediately; forward
//! branches record a fixup on their target frame which is patched when the
//! frame's `end` is reached. `if` lowers to a `BrUnless` that jumps past the
//! `then` arm, and `else` to a `Br` that jumps past the `else` arm.
//!
//! After an unconditional transfer (`unreachable`, `br`, `br_table`, `return`)
//! the rest of the frame is dead. Dead ops are still decoded and emitted, with
//! `reachable: false`, but are not type checked, and the operand stack stays
//! frozen until the frame ends.

use log::trace;

use super::reader::Reader;
use super::{BranchTarget, Instr, IrFunction, LoadKind, NumericOp, Operation, StoreKind, ValidationError};
use crate::error::FormatError;
use crate::module::opcode::*;
use crate::module::{Function, FunctionType, Module, ValueType};
use crate::runtime::Value;

/// Upper bound on declared locals per function
pub const MAX_LOCALS: u64 = 50_000;

/// Validate `function` (index `index` in the module's function space) and translate it to IR
pub fn build_function(module: &Module, index: u32, function: &Function) -> Result<IrFunction, FormatError> {
    let ty = module
        .types
        .get(function.ftype_index as usize)
        .cloned()
        .ok_or(FormatError::TypeIndexOutOfRange {
            index: function.ftype_index,
            len: module.types.len(),
        })?;

    let ir = Builder::new(module, &ty, function)
        .and_then(Builder::build)
        .map_err(|source| FormatError::InvalidFunction {
            function: module
                .function_name(index)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{index}")),
            source,
        })?;

    trace!(
        "function {index}: {} ops, {} locals, max height {}",
        ir.ops.len(),
        ir.locals.len(),
        ir.max_height
    );

    Ok(IrFunction {
        index,
        ty,
        locals: ir.locals,
        ops: ir.ops,
        max_height: ir.max_height as u32,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct ControlFrame {
    kind: FrameKind,
    result: Vec<ValueType>,
    /// Operand height on entry
    height: usize,
    /// First op of the frame; the branch target of a loop
    start: usize,
    unreachable: bool,
    /// Opened inside dead code, so the whole frame is dead
    entered_dead: bool,
    /// The `BrUnless` emitted for an `if`, until `else` or `end` patches it
    else_fixup: Option<usize>,
    /// Forward branches to this frame's end as (op index, target slot)
    fixups: Vec<(usize, usize)>,
}

impl ControlFrame {
    fn label_types(&self) -> &[ValueType] {
        if self.kind == FrameKind::Loop {
            &[]
        } else {
            &self.result
        }
    }
}

struct Builder<'a> {
    module: &'a Module,
    reader: Reader<'a>,
    locals: Vec<ValueType>,
    ops: Vec<Instr>,
    operands: Vec<ValueType>,
    frames: Vec<ControlFrame>,
    max_height: usize,
}

impl<'a> Builder<'a> {
    fn new(module: &'a Module, ty: &FunctionType, function: &'a Function) -> Result<Self, ValidationError> {
        if function.locals.len() > MAX_LOCALS {
            return Err(ValidationError::TooManyLocals);
        }
        let mut locals = ty.parameters.clone();
        for (count, value_type) in function.locals.iter() {
            locals.extend(std::iter::repeat(*value_type).take(*count as usize));
        }

        Ok(Builder {
            module,
            reader: Reader::new(&function.body),
            locals,
            ops: Vec::new(),
            operands: Vec::new(),
            frames: vec![ControlFrame {
                kind: FrameKind::Function,
                result: ty.return_types.clone(),
                height: 0,
                start: 0,
                unreachable: false,
                entered_dead: false,
                else_fixup: None,
                fixups: Vec::new(),
            }],
            max_height: 0,
        })
    }

    fn build(mut self) -> Result<Self, ValidationError> {
        while !self.frames.is_empty() {
            let opcode = self.reader.read_byte()?;
            self.step(opcode)?;
        }
        if !self.reader.is_empty() {
            return Err(ValidationError::TrailingBytes);
        }
        Ok(self)
    }

    // Frames -------------------------------------------------------------------

    fn frame(&self) -> &ControlFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn live(&self) -> bool {
        !self.frame().unreachable
    }

    fn set_unreachable(&mut self) {
        let last = self.frames.len() - 1;
        self.frames[last].unreachable = true;
    }

    fn push_frame(&mut self, kind: FrameKind, result: Vec<ValueType>) {
        let dead = !self.live();
        self.frames.push(ControlFrame {
            kind,
            result,
            height: self.operands.len(),
            start: self.ops.len(),
            unreachable: dead,
            entered_dead: dead,
            else_fixup: None,
            fixups: Vec::new(),
        });
    }

    fn label(&self, depth: u32) -> Result<usize, ValidationError> {
        let len = self.frames.len();
        if depth as usize >= len {
            return Err(ValidationError::UnknownLabel(depth));
        }
        Ok(len - 1 - depth as usize)
    }

    fn label_types(&self, frame_index: usize) -> Vec<ValueType> {
        self.frames[frame_index].label_types().to_vec()
    }

    /// Branch target for the frame at `frame_index`, used by the op about to be emitted
    fn target(&mut self, frame_index: usize, slot: usize) -> BranchTarget {
        let op_index = self.ops.len();
        let frame = &mut self.frames[frame_index];
        if frame.kind == FrameKind::Loop {
            return BranchTarget {
                pc: frame.start,
                height: frame.height as u32,
                arity: 0,
            };
        }
        frame.fixups.push((op_index, slot));
        BranchTarget {
            pc: BranchTarget::UNRESOLVED,
            height: frame.height as u32,
            arity: frame.result.len() as u32,
        }
    }

    fn patch(&mut self, op_index: usize, slot: usize, pc: usize) {
        match &mut self.ops[op_index].op {
            Operation::Br(target) | Operation::BrIf(target) | Operation::BrUnless(target) => target.pc = pc,
            Operation::BrTable { targets, default } => match targets.get_mut(slot) {
                Some(target) => target.pc = pc,
                None => default.pc = pc,
            },
            other => unreachable!("{other:?} has no branch target"),
        }
    }

    /// The operands above the frame base must be exactly the frame's results
    fn check_frame_end(&self) -> Result<(), ValidationError> {
        let frame = self.frame();
        if frame.unreachable {
            return Ok(());
        }
        let found = self.operands.len() - frame.height;
        if found != frame.result.len() {
            return Err(ValidationError::ArityMismatch {
                expected: frame.result.len(),
                found,
            });
        }
        for (expected, found) in frame.result.iter().zip(&self.operands[frame.height..]) {
            if expected != found {
                return Err(ValidationError::TypeMismatch {
                    expected: *expected,
                    found: *found,
                });
            }
        }
        Ok(())
    }

    // Operand types ------------------------------------------------------------

    fn push(&mut self, value_type: ValueType) {
        if self.live() {
            self.operands.push(value_type);
            self.max_height = self.max_height.max(self.operands.len());
        }
    }

    /// Pop one operand type, or `None` in dead code
    fn pop(&mut self) -> Result<Option<ValueType>, ValidationError> {
        if !self.live() {
            return Ok(None);
        }
        if self.operands.len() <= self.frame().height {
            return Err(ValidationError::StackUnderflow);
        }
        Ok(self.operands.pop())
    }

    fn pop_expect(&mut self, expected: ValueType) -> Result<(), ValidationError> {
        match self.pop()? {
            Some(found) if found != expected => Err(ValidationError::TypeMismatch { expected, found }),
            _ => Ok(()),
        }
    }

    fn pop_all(&mut self, types: &[ValueType]) -> Result<(), ValidationError> {
        for value_type in types.iter().rev() {
            self.pop_expect(*value_type)?;
        }
        Ok(())
    }

    /// Check the top of the stack against `types` without popping
    fn check_top(&self, types: &[ValueType]) -> Result<(), ValidationError> {
        if !self.live() {
            return Ok(());
        }
        let available = self.operands.len() - self.frame().height;
        if available < types.len() {
            return Err(ValidationError::ArityMismatch {
                expected: types.len(),
                found: available,
            });
        }
        let top = &self.operands[self.operands.len() - types.len()..];
        for (expected, found) in types.iter().zip(top) {
            if expected != found {
                return Err(ValidationError::TypeMismatch {
                    expected: *expected,
                    found: *found,
                });
            }
        }
        Ok(())
    }

    fn emit(&mut self, op: Operation, height: usize) {
        let reachable = self.live();
        self.ops.push(Instr {
            op,
            height: height as u32,
            reachable,
        });
    }

    // Immediates ---------------------------------------------------------------

    fn read_block_type(&mut self) -> Result<Vec<ValueType>, ValidationError> {
        let byte = self.reader.read_byte()?;
        if byte == BLOCK_TYPE_EMPTY {
            return Ok(Vec::new());
        }
        ValueType::decode(byte)
            .map(|value_type| vec![value_type])
            .ok_or(ValidationError::InvalidBlockType(byte))
    }

    fn read_zero_byte(&mut self) -> Result<(), ValidationError> {
        match self.reader.read_byte()? {
            0 => Ok(()),
            _ => Err(ValidationError::ZeroByteExpected),
        }
    }

    fn require_memory(&self) -> Result<(), ValidationError> {
        if self.module.memory_count() == 0 {
            return Err(ValidationError::MissingMemory);
        }
        Ok(())
    }

    /// Read a memarg and return its offset
    fn read_memarg(&mut self, width: u32) -> Result<u32, ValidationError> {
        let align = self.reader.read_vu32()?;
        let offset = self.reader.read_vu32()?;
        self.require_memory()?;
        if align >= 32 || (1u64 << align) > width as u64 {
            return Err(ValidationError::InvalidAlignment);
        }
        Ok(offset)
    }

    fn local(&self, index: u32) -> Result<ValueType, ValidationError> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(ValidationError::UnknownLocal(index))
    }

    // Instructions -------------------------------------------------------------

    fn step(&mut self, opcode: u8) -> Result<(), ValidationError> {
        let height = self.operands.len();
        match opcode {
            UNREACHABLE => {
                self.emit(Operation::Unreachable, height);
                self.set_unreachable();
            }
            NOP => {}
            BLOCK => {
                let result = self.read_block_type()?;
                self.push_frame(FrameKind::Block, result);
            }
            LOOP => {
                let result = self.read_block_type()?;
                self.push_frame(FrameKind::Loop, result);
            }
            IF => {
                let result = self.read_block_type()?;
                self.pop_expect(ValueType::I32)?;
                let fixup = self.ops.len();
                let target = BranchTarget {
                    pc: BranchTarget::UNRESOLVED,
                    height: self.operands.len() as u32,
                    arity: 0,
                };
                self.emit(Operation::BrUnless(target), height);
                self.push_frame(FrameKind::If, result);
                let last = self.frames.len() - 1;
                self.frames[last].else_fixup = Some(fixup);
            }
            ELSE => self.handle_else()?,
            END => self.handle_end()?,
            BR => {
                let depth = self.reader.read_vu32()?;
                let frame_index = self.label(depth)?;
                self.pop_all(&self.label_types(frame_index))?;
                let target = self.target(frame_index, 0);
                self.emit(Operation::Br(target), height);
                self.set_unreachable();
            }
            BR_IF => {
                let depth = self.reader.read_vu32()?;
                let frame_index = self.label(depth)?;
                self.pop_expect(ValueType::I32)?;
                self.check_top(&self.label_types(frame_index))?;
                let target = self.target(frame_index, 0);
                self.emit(Operation::BrIf(target), height);
            }
            BR_TABLE => self.br_table(height)?,
            RETURN => {
                self.pop_all(&self.label_types(0))?;
                self.emit(Operation::Return, height);
                self.set_unreachable();
            }
            CALL => {
                let index = self.reader.read_vu32()?;
                let ty = self
                    .module
                    .function_type(index)
                    .cloned()
                    .ok_or(ValidationError::UnknownFunction(index))?;
                self.pop_all(&ty.parameters)?;
                for value_type in ty.return_types {
                    self.push(value_type);
                }
                self.emit(Operation::Call(index), height);
            }
            CALL_INDIRECT => {
                let type_index = self.reader.read_vu32()?;
                self.read_zero_byte()?;
                if self.module.table_count() == 0 {
                    return Err(ValidationError::MissingTable);
                }
                let ty = self
                    .module
                    .types
                    .get(type_index as usize)
                    .cloned()
                    .ok_or(ValidationError::UnknownType(type_index))?;
                self.pop_expect(ValueType::I32)?;
                self.pop_all(&ty.parameters)?;
                for value_type in ty.return_types {
                    self.push(value_type);
                }
                self.emit(Operation::CallIndirect(type_index), height);
            }
            DROP => {
                let value_type = self.pop()?.unwrap_or(ValueType::I32);
                self.emit(Operation::Drop(value_type), height);
            }
            SELECT => {
                self.pop_expect(ValueType::I32)?;
                let second = self.pop()?;
                let first = self.pop()?;
                let value_type = match (first, second) {
                    (Some(expected), Some(found)) if expected != found => {
                        return Err(ValidationError::TypeMismatch { expected, found })
                    }
                    (Some(value_type), _) => value_type,
                    _ => ValueType::I32,
                };
                self.push(value_type);
                self.emit(Operation::Select(value_type), height);
            }
            LOCAL_GET => {
                let index = self.reader.read_vu32()?;
                let value_type = self.local(index)?;
                self.push(value_type);
                self.emit(Operation::LocalGet(index), height);
            }
            LOCAL_SET => {
                let index = self.reader.read_vu32()?;
                let value_type = self.local(index)?;
                self.pop_expect(value_type)?;
                self.emit(Operation::LocalSet(index), height);
            }
            LOCAL_TEE => {
                let index = self.reader.read_vu32()?;
                let value_type = self.local(index)?;
                self.pop_expect(value_type)?;
                self.push(value_type);
                self.emit(Operation::LocalTee(index), height);
            }
            GLOBAL_GET => {
                let index = self.reader.read_vu32()?;
                let global_type = self
                    .module
                    .global_type(index)
                    .ok_or(ValidationError::UnknownGlobal(index))?;
                self.push(global_type.value_type);
                self.emit(Operation::GlobalGet(index), height);
            }
            GLOBAL_SET => {
                let index = self.reader.read_vu32()?;
                let global_type = self
                    .module
                    .global_type(index)
                    .ok_or(ValidationError::UnknownGlobal(index))?;
                if !global_type.mutable {
                    return Err(ValidationError::ImmutableGlobal(index));
                }
                self.pop_expect(global_type.value_type)?;
                self.emit(Operation::GlobalSet(index), height);
            }
            I32_LOAD..=I64_LOAD32_U => {
                let kind = load_kind(opcode);
                let offset = self.read_memarg(kind.width())?;
                self.pop_expect(ValueType::I32)?;
                self.push(kind.result_type());
                self.emit(Operation::Load { kind, offset }, height);
            }
            I32_STORE..=I64_STORE32 => {
                let kind = store_kind(opcode);
                let offset = self.read_memarg(kind.width())?;
                self.pop_expect(kind.value_type())?;
                self.pop_expect(ValueType::I32)?;
                self.emit(Operation::Store { kind, offset }, height);
            }
            MEMORY_SIZE => {
                self.read_zero_byte()?;
                self.require_memory()?;
                self.push(ValueType::I32);
                self.emit(Operation::MemorySize, height);
            }
            MEMORY_GROW => {
                self.read_zero_byte()?;
                self.require_memory()?;
                self.pop_expect(ValueType::I32)?;
                self.push(ValueType::I32);
                self.emit(Operation::MemoryGrow, height);
            }
            I32_CONST => {
                let value = Value::I32(self.reader.read_vs32()?);
                self.push(ValueType::I32);
                self.emit(Operation::Const(value), height);
            }
            I64_CONST => {
                let value = Value::I64(self.reader.read_vs64()?);
                self.push(ValueType::I64);
                self.emit(Operation::Const(value), height);
            }
            F32_CONST => {
                let value = Value::F32(self.reader.read_f32()?);
                self.push(ValueType::F32);
                self.emit(Operation::Const(value), height);
            }
            F64_CONST => {
                let value = Value::F64(self.reader.read_f64()?);
                self.push(ValueType::F64);
                self.emit(Operation::Const(value), height);
            }
            _ => {
                let op = NumericOp::from_opcode(opcode).ok_or(ValidationError::UnknownOpcode(opcode))?;
                let (params, result) = op.signature();
                self.pop_all(params)?;
                self.push(result);
                self.emit(Operation::Numeric(op), height);
            }
        }
        Ok(())
    }

    fn br_table(&mut self, height: usize) -> Result<(), ValidationError> {
        let count = self.reader.read_vu32()?;
        let mut depths = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            depths.push(self.reader.read_vu32()?);
        }
        let default_depth = self.reader.read_vu32()?;
        let default_index = self.label(default_depth)?;
        self.pop_expect(ValueType::I32)?;

        let carried = self.label_types(default_index);
        let mut frame_indices = Vec::with_capacity(depths.len());
        for depth in depths {
            let frame_index = self.label(depth)?;
            if self.live() && self.frames[frame_index].label_types() != carried.as_slice() {
                return Err(ValidationError::BrTableArity);
            }
            frame_indices.push(frame_index);
        }
        self.pop_all(&carried)?;

        let targets: Vec<BranchTarget> = frame_indices
            .iter()
            .enumerate()
            .map(|(slot, frame_index)| self.target(*frame_index, slot))
            .collect();
        let default = self.target(default_index, targets.len());
        self.emit(
            Operation::BrTable {
                targets: targets.into_boxed_slice(),
                default,
            },
            height,
        );
        self.set_unreachable();
        Ok(())
    }

    fn handle_else(&mut self) -> Result<(), ValidationError> {
        let frame_index = self.frames.len() - 1;
        if self.frames[frame_index].kind != FrameKind::If {
            return Err(ValidationError::UnexpectedElse);
        }
        self.check_frame_end()?;

        let height = self.operands.len();
        let target = self.target(frame_index, 0);
        self.emit(Operation::Br(target), height);

        let frame = &mut self.frames[frame_index];
        frame.kind = FrameKind::Else;
        frame.unreachable = frame.entered_dead;
        let frame_height = frame.height;
        let else_fixup = frame.else_fixup.take();

        self.operands.truncate(frame_height);
        if let Some(fixup) = else_fixup {
            self.patch(fixup, 0, self.ops.len());
        }
        Ok(())
    }

    fn handle_end(&mut self) -> Result<(), ValidationError> {
        self.check_frame_end()?;
        let Some(frame) = self.frames.pop() else {
            unreachable!("end with no open frame");
        };

        if frame.kind == FrameKind::If && !frame.entered_dead && !frame.result.is_empty() {
            // the missing else arm produces nothing
            return Err(ValidationError::ArityMismatch {
                expected: frame.result.len(),
                found: 0,
            });
        }

        let end = self.ops.len();
        if let Some(fixup) = frame.else_fixup {
            self.patch(fixup, 0, end);
        }
        for (op_index, slot) in frame.fixups {
            self.patch(op_index, slot, end);
        }

        if frame.kind == FrameKind::Function {
            self.ops.push(Instr {
                op: Operation::Return,
                height: frame.result.len() as u32,
                reachable: true,
            });
            return Ok(());
        }

        self.operands.truncate(frame.height);
        for value_type in frame.result {
            self.push(value_type);
        }
        Ok(())
    }
}

fn load_kind(opcode: u8) -> LoadKind {
    match opcode {
        I32_LOAD => LoadKind::I32,
        I64_LOAD => LoadKind::I64,
        F32_LOAD => LoadKind::F32,
        F64_LOAD => LoadKind::F64,
        I32_LOAD8_S => LoadKind::I32S8,
        I32_LOAD8_U => LoadKind::I32U8,
        I32_LOAD16_S => LoadKind::I32S16,
        I32_LOAD16_U => LoadKind::I32U16,
        I64_LOAD8_S => LoadKind::I64S8,
        I64_LOAD8_U => LoadKind::I64U8,
        I64_LOAD16_S => LoadKind::I64S16,
        I64_LOAD16_U => LoadKind::I64U16,
        I64_LOAD32_S => LoadKind::I64S32,
        I64_LOAD32_U => LoadKind::I64U32,
        _ => unreachable!("0x{opcode:02x} is not a load"),
    }
}

fn store_kind(opcode: u8) -> StoreKind {
    match opcode {
        I32_STORE => StoreKind::I32,
        I64_STORE => StoreKind::I64,
        F32_STORE => StoreKind::F32,
        F64_STORE => StoreKind::F64,
        I32_STORE8 => StoreKind::I32As8,
        I32_STORE16 => StoreKind::I32As16,
        I64_STORE8 => StoreKind::I64As8,
        I64_STORE16 => StoreKind::I64As16,
        I64_STORE32 => StoreKind::I64As32,
        _ => unreachable!("0x{opcode:02x} is not a store"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::code::CodeBuilder;
    use crate::module::{GlobalType, Limits, Locals};
    use ValueType::{F64, I32, I64};

    fn build(params: Vec<ValueType>, results: Vec<ValueType>, locals: Locals, body: CodeBuilder) -> Result<IrFunction, ValidationError> {
        let mut module = Module::new();
        module.memories.push(Limits::new(1, None));
        let ty = module.add_type(FunctionType::new(params, results));
        let index = module.add_function(ty, locals, body.finish());
        build_function(&module, index, &module.functions[index as usize]).map_err(|e| match e {
            FormatError::InvalidFunction { source, .. } => source,
            other => panic!("unexpected error {other}"),
        })
    }

    fn ops(ir: &IrFunction) -> Vec<&Operation> {
        ir.ops.iter().map(|instr| &instr.op).collect()
    }

    #[test]
    fn test_straight_line_heights() {
        let ir = build(
            vec![I32, I32],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().local_get(0).local_get(1).op(I32_ADD).end(),
        )
        .unwrap();

        let heights: Vec<u32> = ir.ops.iter().map(|i| i.height).collect();
        assert_eq!(heights, vec![0, 1, 2, 1]);
        assert_eq!(ir.max_height, 2);
        assert_eq!(ir.ops.last().unwrap().op, Operation::Return);
        assert_eq!(ir.frame_slots(), 4);
    }

    #[test]
    fn test_locals_include_params() {
        let ir = build(
            vec![I64],
            vec![],
            Locals::new(vec![(2, F64), (1, I32)]),
            CodeBuilder::new().end(),
        )
        .unwrap();
        assert_eq!(ir.locals, vec![I64, F64, F64, I32]);
        assert_eq!(ir.param_count(), 1);
    }

    #[test]
    fn test_block_branch_resolves_forward() {
        // block (result i32) i32.const 1 br 0 end
        let ir = build(
            vec![],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().block(Some(I32)).i32_const(1).br(0).end().end(),
        )
        .unwrap();

        assert_eq!(
            ir.ops[1].op,
            Operation::Br(BranchTarget {
                pc: 2,
                height: 0,
                arity: 1
            })
        );
        assert_eq!(ir.ops[2].op, Operation::Return);
    }

    #[test]
    fn test_loop_branch_resolves_backward() {
        // loop local.get 0 br_if 0 end
        let ir = build(
            vec![I32],
            vec![],
            Locals::empty(),
            CodeBuilder::new().loop_(None).local_get(0).br_if(0).end().end(),
        )
        .unwrap();
        assert_eq!(
            ir.ops[1].op,
            Operation::BrIf(BranchTarget {
                pc: 0,
                height: 0,
                arity: 0
            })
        );
    }

    #[test]
    fn test_if_else_lowering() {
        let ir = build(
            vec![I32],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new()
                .local_get(0)
                .if_(Some(I32))
                .i32_const(10)
                .else_()
                .i32_const(20)
                .end()
                .end(),
        )
        .unwrap();

        // local.get, br_unless, const 10, br, const 20, return
        let ops = ops(&ir);
        assert_eq!(ops.len(), 6);
        assert_eq!(
            *ops[1],
            Operation::BrUnless(BranchTarget {
                pc: 4,
                height: 0,
                arity: 0
            })
        );
        assert_eq!(
            *ops[3],
            Operation::Br(BranchTarget {
                pc: 5,
                height: 0,
                arity: 1
            })
        );
        assert_eq!(ir.ops[4].height, 0);
        assert_eq!(ir.ops[5].height, 1);
    }

    #[test]
    fn test_br_table_targets() {
        let ir = build(
            vec![I32],
            vec![],
            Locals::empty(),
            CodeBuilder::new()
                .block(None)
                .block(None)
                .local_get(0)
                .br_table(&[0, 1], 1)
                .end()
                .end()
                .end(),
        )
        .unwrap();

        let Operation::BrTable { targets, default } = &ir.ops[1].op else {
            panic!("expected br_table, got {:?}", ir.ops[1].op);
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].pc, 2);
        assert_eq!(targets[1].pc, 2);
        assert_eq!(default.pc, 2);
    }

    #[test]
    fn test_dead_code_is_marked() {
        let ir = build(
            vec![],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new()
                .i32_const(1)
                .return_()
                .i32_const(2)
                .op(I64_ADD)
                .end(),
        )
        .unwrap();

        let reachable: Vec<bool> = ir.ops.iter().map(|i| i.reachable).collect();
        assert_eq!(reachable, vec![true, true, false, false, true]);
    }

    #[test]
    fn test_dead_nested_block_stays_dead() {
        let ir = build(
            vec![],
            vec![],
            Locals::empty(),
            CodeBuilder::new()
                .unreachable()
                .block(None)
                .i32_const(1)
                .drop()
                .end()
                .end(),
        )
        .unwrap();
        assert!(ir.ops[1..ir.ops.len() - 1].iter().all(|i| !i.reachable));
    }

    #[test]
    fn test_code_after_block_with_branch_is_live() {
        let ir = build(
            vec![],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().block(None).br(0).end().i32_const(3).end(),
        )
        .unwrap();
        assert!(ir.ops[1].reachable);
        assert_eq!(ir.ops[1].height, 0);
    }

    #[test]
    fn test_rejects_height_mismatch_at_end() {
        let err = build(vec![], vec![I32], Locals::empty(), CodeBuilder::new().end()).unwrap_err();
        assert_eq!(err, ValidationError::ArityMismatch { expected: 1, found: 0 });

        let err = build(
            vec![],
            vec![],
            Locals::empty(),
            CodeBuilder::new().block(None).i32_const(1).end().end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::ArityMismatch { expected: 0, found: 1 });
    }

    #[test]
    fn test_rejects_type_mismatch() {
        let err = build(
            vec![],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().i64_const(1).end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::TypeMismatch { expected: I32, found: I64 });

        let err = build(
            vec![],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().i32_const(1).i64_const(2).op(I32_ADD).end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::TypeMismatch { expected: I32, found: I64 });
    }

    #[test]
    fn test_rejects_underflow_across_block_boundary() {
        let err = build(
            vec![],
            vec![],
            Locals::empty(),
            CodeBuilder::new().i32_const(1).block(None).drop().end().drop().end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::StackUnderflow);
    }

    #[test]
    fn test_rejects_if_without_else_producing_value() {
        let err = build(
            vec![I32],
            vec![I32],
            Locals::empty(),
            CodeBuilder::new().local_get(0).if_(Some(I32)).i32_const(1).end().end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::ArityMismatch { expected: 1, found: 0 });
    }

    #[test]
    fn test_rejects_bad_labels_and_structure() {
        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().br(1).end()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownLabel(1));

        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().else_().end()).unwrap_err();
        assert_eq!(err, ValidationError::UnexpectedElse);

        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().block(None).end()).unwrap_err();
        assert_eq!(err, ValidationError::UnexpectedEof);

        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().end().op(NOP)).unwrap_err();
        assert_eq!(err, ValidationError::TrailingBytes);

        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().op(0xfc).end()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownOpcode(0xfc));
    }

    #[test]
    fn test_rejects_bad_references() {
        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().local_get(0).drop().end()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownLocal(0));

        let err = build(vec![], vec![], Locals::empty(), CodeBuilder::new().call(5).end()).unwrap_err();
        assert_eq!(err, ValidationError::UnknownFunction(5));

        let err = build(
            vec![],
            vec![],
            Locals::empty(),
            CodeBuilder::new().i32_const(0).call_indirect(0).end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingTable);

        let err = build(
            vec![],
            vec![],
            Locals::empty(),
            CodeBuilder::new().i32_const(0).memory(I32_LOAD, 3, 0).drop().end(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidAlignment);
    }

    #[test]
    fn test_rejects_immutable_global_set() {
        let mut module = Module::new();
        let global = module.add_global(
            GlobalType {
                value_type: I32,
                mutable: false,
            },
            crate::module::ConstExpr::I32Const(0),
        );
        let ty = module.add_type(FunctionType::new(vec![], vec![]));
        let body = CodeBuilder::new().i32_const(1).global_set(global).end().finish();
        let index = module.add_function(ty, Locals::empty(), body);

        let err = build_function(&module, index, &module.functions[0]).unwrap_err();
        assert!(matches!(
            err,
            FormatError::InvalidFunction {
                source: ValidationError::ImmutableGlobal(0),
                ..
            }
        ));
    }

    #[test]
    fn test_error_names_function() {
        let mut module = Module::new();
        let ty = module.add_type(FunctionType::new(vec![], vec![I32]));
        let index = module.add_function(ty, Locals::empty(), CodeBuilder::new().end().finish());
        let err = build_function(&module, index, &module.functions[0]).unwrap_err();
        assert!(err.to_string().starts_with("function #0:"), "{err}");
    }
}
