//! IR to x86-64 lowering
//!
//! Every guest function becomes one native function with the signature of
//! [`Entry`](super::Entry). The frame lives in memory owned by the caller:
//! `r12` points at slot 0, locals occupy the first slots and operand height
//! `h` lives at slot `locals + h`. Every op loads its operands from slots and
//! writes its result back, so no value lives in a register across ops.
//!
//! Register use:
//!
//! ```text
//! rbx    *mut JitContext
//! r12    frame base
//! rax    status on exit, scratch otherwise
//! rcx    scratch
//! rdx    scratch, effective address of memory accesses
//! ```
//!
//! A nonzero `eax` at exit is a trap code or [`HOST_ERROR`](super::context::HOST_ERROR).

use super::asm::{Alu, Assembler, Cond, Label, Reg, Shift};
use super::context::{self, MEMORY_BASE_OFFSET, MEMORY_LEN_OFFSET};
use crate::error::CompileError;
use crate::ir::{BranchTarget, IrFunction, LoadKind, NumericOp, Operation};
use crate::module::opcode::*;
use crate::module::Module;
use crate::runtime::TrapKind;

const SLOT: usize = 8;

pub(super) fn compile_function(module: &Module, function: &IrFunction) -> Result<Vec<u8>, CompileError> {
    if function.frame_slots().saturating_mul(SLOT) > i32::MAX as usize {
        return Err(CompileError::Unsupported {
            function: function.index,
            reason: format!("frame of {} slots is too large", function.frame_slots()),
        });
    }

    let mut codegen = Codegen::new(module, function);
    codegen.prologue();
    for pc in 0..function.ops.len() {
        codegen.lower(pc)?;
    }
    codegen.epilogue();

    let index = function.index;
    codegen.asm.finish().ok_or_else(|| CompileError::Unsupported {
        function: index,
        reason: "branch out of range".to_string(),
    })
}

struct Codegen<'a> {
    asm: Assembler,
    module: &'a Module,
    function: &'a IrFunction,
    /// One label per op, bound at its first byte
    labels: Vec<Label>,
    /// Falls into `exit` with a zero status
    done: Label,
    /// Restores callee-saved registers and returns `eax`
    exit: Label,
    traps: Vec<(TrapKind, Label)>,
}

impl<'a> Codegen<'a> {
    fn new(module: &'a Module, function: &'a IrFunction) -> Self {
        let mut asm = Assembler::new();
        let labels = function.ops.iter().map(|_| asm.new_label()).collect();
        let done = asm.new_label();
        let exit = asm.new_label();
        Codegen {
            asm,
            module,
            function,
            labels,
            done,
            exit,
            traps: Vec::new(),
        }
    }

    /// Displacement of an absolute frame slot
    fn slot(&self, index: usize) -> i32 {
        (index * SLOT) as i32
    }

    /// Displacement of the operand at `height`
    fn operand(&self, height: usize) -> i32 {
        self.slot(self.function.locals.len() + height)
    }

    fn trap(&mut self, kind: TrapKind) -> Label {
        if let Some((_, label)) = self.traps.iter().find(|(k, _)| *k == kind) {
            return *label;
        }
        let label = self.asm.new_label();
        self.traps.push((kind, label));
        label
    }

    fn prologue(&mut self) {
        let asm = &mut self.asm;
        // Three pushes realign rsp to 16 bytes for helper calls.
        asm.push(Reg::Rbx);
        asm.push(Reg::R12);
        asm.push(Reg::Rbp);
        asm.mov(true, Reg::Rbx, Reg::Rdi);
        asm.mov(true, Reg::R12, Reg::Rsi);

        let params = self.function.param_count();
        let locals = self.function.locals.len();
        if locals > params {
            self.asm.alu(false, Alu::Xor, Reg::Rax, Reg::Rax);
            for local in params..locals {
                let disp = self.slot(local);
                self.asm.store_slot(disp, Reg::Rax);
            }
        }
    }

    fn epilogue(&mut self) {
        self.asm.bind(self.done);
        self.asm.alu(false, Alu::Xor, Reg::Rax, Reg::Rax);
        self.asm.bind(self.exit);
        self.asm.pop(Reg::Rbp);
        self.asm.pop(Reg::R12);
        self.asm.pop(Reg::Rbx);
        self.asm.ret();

        for (kind, label) in std::mem::take(&mut self.traps) {
            self.asm.bind(label);
            self.asm.mov_imm32(Reg::Rax, kind.code());
            self.asm.jmp(self.exit);
        }
    }

    /// Copy `count` slots from `from` down to `to`, through `rcx`
    fn carry(&mut self, from: usize, to: usize, count: usize) {
        if from == to {
            return;
        }
        for k in 0..count {
            let (src, dst) = (self.slot(from + k), self.slot(to + k));
            self.asm.load_slot(true, Reg::Rcx, src);
            self.asm.store_slot(dst, Reg::Rcx);
        }
    }

    /// Move a branch's carried values into place. `height` is the operand
    /// height once the branch's own operands are popped.
    fn carries(&self, height: usize, target: &BranchTarget) -> bool {
        target.arity > 0 && height - target.arity as usize != target.height as usize
    }

    fn carry_to(&mut self, height: usize, target: &BranchTarget) {
        let locals = self.function.locals.len();
        let arity = target.arity as usize;
        self.carry(locals + height - arity, locals + target.height as usize, arity);
    }

    /// Branch to `target` when `cond` holds, carrying values if needed
    fn branch_if(&mut self, cond: Cond, inverse: Cond, height: usize, target: &BranchTarget) {
        let label = self.labels[target.pc];
        if self.carries(height, target) {
            let skip = self.asm.new_label();
            self.asm.jcc(inverse, skip);
            self.carry_to(height, target);
            self.asm.jmp(label);
            self.asm.bind(skip);
        } else {
            self.asm.jcc(cond, label);
        }
    }

    fn branch(&mut self, height: usize, target: &BranchTarget) {
        self.carry_to(height, target);
        self.asm.jmp(self.labels[target.pc]);
    }

    /// Call a runtime helper with `(ctx, arg, &frame[disp])` and exit if it fails
    fn call_helper(&mut self, helper: usize, arg: u32, disp: i32) {
        self.asm.mov(true, Reg::Rdi, Reg::Rbx);
        self.asm.mov_imm32(Reg::Rsi, arg);
        self.asm.lea_slot(Reg::Rdx, disp);
        self.asm.mov_imm64(Reg::Rax, helper as u64);
        self.asm.call(Reg::Rax);
        self.asm.test(false, Reg::Rax, Reg::Rax);
        self.asm.jcc(Cond::Ne, self.exit);
    }

    fn lower(&mut self, pc: usize) -> Result<(), CompileError> {
        self.asm.bind(self.labels[pc]);
        let function = self.function;
        let instr = &function.ops[pc];
        if !instr.reachable {
            return Ok(());
        }
        let h = instr.height as usize;

        match &instr.op {
            Operation::Unreachable => {
                let label = self.trap(TrapKind::Unreachable);
                self.asm.jmp(label);
            }
            Operation::Br(target) => self.branch(h, target),
            Operation::BrIf(target) => {
                let cond = self.operand(h - 1);
                self.asm.load_slot(false, Reg::Rax, cond);
                self.asm.test(false, Reg::Rax, Reg::Rax);
                self.branch_if(Cond::Ne, Cond::E, h - 1, target);
            }
            Operation::BrUnless(target) => {
                let cond = self.operand(h - 1);
                self.asm.load_slot(false, Reg::Rax, cond);
                self.asm.test(false, Reg::Rax, Reg::Rax);
                self.branch_if(Cond::E, Cond::Ne, h - 1, target);
            }
            Operation::BrTable { targets, default } => {
                let index = self.operand(h - 1);
                self.asm.load_slot(false, Reg::Rax, index);
                for (i, target) in targets.iter().enumerate() {
                    self.asm.alu_imm(false, Alu::Cmp, Reg::Rax, i as u32);
                    self.branch_if(Cond::E, Cond::Ne, h - 1, target);
                }
                self.branch(h - 1, default);
            }
            Operation::Return => {
                let results = self.function.result_count();
                let locals = self.function.locals.len();
                self.carry(locals + h - results, 0, results);
                self.asm.jmp(self.done);
            }
            Operation::Call(index) => {
                let params = self.callee_params(*index)?;
                let frame = self.operand(h - params);
                self.call_helper(context::jit_call as usize, *index, frame);
            }
            Operation::CallIndirect(type_index) => {
                let params = self
                    .module
                    .types
                    .get(*type_index as usize)
                    .map(|ty| ty.parameters.len())
                    .ok_or_else(|| self.unsupported(format!("unknown type {type_index}")))?;
                let element = self.operand(h - 1);
                let frame = self.operand(h - 1 - params);
                self.asm.load_slot(false, Reg::Rcx, element);
                self.call_helper(context::jit_call_indirect as usize, *type_index, frame);
            }
            Operation::Drop(_) => {}
            Operation::Select(_) => {
                let (a, b, c) = (self.operand(h - 3), self.operand(h - 2), self.operand(h - 1));
                self.asm.load_slot(true, Reg::Rax, a);
                self.asm.load_slot(true, Reg::Rcx, b);
                self.asm.load_slot(false, Reg::Rdx, c);
                self.asm.test(false, Reg::Rdx, Reg::Rdx);
                self.asm.cmov(true, Cond::E, Reg::Rax, Reg::Rcx);
                self.asm.store_slot(a, Reg::Rax);
            }
            Operation::LocalGet(local) => {
                let (src, dst) = (self.slot(*local as usize), self.operand(h));
                self.asm.load_slot(true, Reg::Rax, src);
                self.asm.store_slot(dst, Reg::Rax);
            }
            Operation::LocalSet(local) | Operation::LocalTee(local) => {
                let (src, dst) = (self.operand(h - 1), self.slot(*local as usize));
                self.asm.load_slot(true, Reg::Rax, src);
                self.asm.store_slot(dst, Reg::Rax);
            }
            Operation::GlobalGet(global) => {
                let slot = self.operand(h);
                self.call_helper(context::jit_global_get as usize, *global, slot);
            }
            Operation::GlobalSet(global) => {
                let slot = self.operand(h - 1);
                self.call_helper(context::jit_global_set as usize, *global, slot);
            }
            Operation::Load { kind, offset } => {
                let slot = self.operand(h - 1);
                self.effective_address(slot, *offset, kind.width());
                let (signed, wide) = load_extension(*kind);
                self.asm.load_rdx(kind.width(), signed, wide);
                self.asm.store_slot(slot, Reg::Rax);
            }
            Operation::Store { kind, offset } => {
                let (address, value) = (self.operand(h - 2), self.operand(h - 1));
                self.effective_address(address, *offset, kind.width());
                self.asm.load_slot(true, Reg::Rax, value);
                self.asm.store_rdx(kind.width());
            }
            Operation::MemorySize => {
                let slot = self.operand(h);
                self.asm.load_rbx(Reg::Rax, MEMORY_LEN_OFFSET);
                self.asm.shr_imm(true, Reg::Rax, 16);
                self.asm.store_slot(slot, Reg::Rax);
            }
            Operation::MemoryGrow => {
                let slot = self.operand(h - 1);
                self.call_helper(context::jit_memory_grow as usize, 0, slot);
            }
            Operation::Const(value) => {
                let slot = self.operand(h);
                self.asm.mov_imm64(Reg::Rax, value.to_bits());
                self.asm.store_slot(slot, Reg::Rax);
            }
            Operation::Numeric(op) => self.numeric(*op, h),
        }
        Ok(())
    }

    fn callee_params(&self, index: u32) -> Result<usize, CompileError> {
        self.module
            .function_type(index)
            .map(|ty| ty.parameters.len())
            .ok_or_else(|| self.unsupported(format!("unknown function {index}")))
    }

    fn unsupported(&self, reason: String) -> CompileError {
        CompileError::Unsupported {
            function: self.function.index,
            reason,
        }
    }

    /// Bounds-check `address + offset + width` against the memory length and
    /// leave the effective host address in `rdx`
    fn effective_address(&mut self, address: i32, offset: u32, width: u32) {
        let oob = self.trap(TrapKind::OutOfBoundsMemoryAccess);
        let asm = &mut self.asm;
        asm.load_slot(false, Reg::Rax, address);
        asm.mov_imm64(Reg::Rcx, offset as u64 + width as u64);
        asm.alu(true, Alu::Add, Reg::Rcx, Reg::Rax);
        asm.cmp_rbx(Reg::Rcx, MEMORY_LEN_OFFSET);
        asm.jcc(Cond::A, oob);
        asm.load_rbx(Reg::Rdx, MEMORY_BASE_OFFSET);
        asm.alu(true, Alu::Add, Reg::Rdx, Reg::Rax);
        if offset != 0 {
            asm.mov_imm64(Reg::Rcx, offset as u64);
            asm.alu(true, Alu::Add, Reg::Rdx, Reg::Rcx);
        }
    }

    fn numeric(&mut self, op: NumericOp, h: usize) {
        let opcode = op.opcode();
        match opcode {
            I32_EQZ | I64_EQZ => {
                let slot = self.operand(h - 1);
                let wide = opcode == I64_EQZ;
                self.asm.load_slot(wide, Reg::Rax, slot);
                self.asm.test(wide, Reg::Rax, Reg::Rax);
                self.asm.setcc(Cond::E, Reg::Rax);
                self.asm.movzx8(Reg::Rax, Reg::Rax);
                self.asm.store_slot(slot, Reg::Rax);
            }
            I32_EQ..=I32_GE_U | I64_EQ..=I64_GE_U => {
                let wide = opcode >= I64_EQ;
                let cond = int_condition(if wide { opcode - I64_EQ } else { opcode - I32_EQ });
                let (a, _) = self.binary_operands(h, wide);
                self.asm.alu(wide, Alu::Cmp, Reg::Rax, Reg::Rcx);
                self.asm.setcc(cond, Reg::Rax);
                self.asm.movzx8(Reg::Rax, Reg::Rax);
                self.asm.store_slot(a, Reg::Rax);
            }
            F32_EQ..=F64_GE => self.float_compare(opcode, h),
            I32_ADD | I32_SUB | I32_MUL | I32_AND | I32_OR | I32_XOR | I64_ADD | I64_SUB | I64_MUL | I64_AND
            | I64_OR | I64_XOR => {
                let wide = opcode >= I64_ADD;
                let (a, _) = self.binary_operands(h, wide);
                match if wide { opcode - I64_ADD + I32_ADD } else { opcode } {
                    I32_MUL => self.asm.imul(wide, Reg::Rax, Reg::Rcx),
                    narrow => {
                        let alu = match narrow {
                            I32_ADD => Alu::Add,
                            I32_SUB => Alu::Sub,
                            I32_AND => Alu::And,
                            I32_OR => Alu::Or,
                            _ => Alu::Xor,
                        };
                        self.asm.alu(wide, alu, Reg::Rax, Reg::Rcx);
                    }
                }
                self.asm.store_slot(a, Reg::Rax);
            }
            I32_SHL..=I32_ROTR | I64_SHL..=I64_ROTR => {
                let wide = opcode >= I64_SHL;
                let shift = match if wide { opcode - I64_SHL + I32_SHL } else { opcode } {
                    I32_SHL => Shift::Shl,
                    I32_SHR_S => Shift::Sar,
                    I32_SHR_U => Shift::Shr,
                    I32_ROTL => Shift::Rol,
                    _ => Shift::Ror,
                };
                let (a, _) = self.binary_operands(h, wide);
                self.asm.shift_cl(wide, shift, Reg::Rax);
                self.asm.store_slot(a, Reg::Rax);
            }
            I32_DIV_S..=I32_REM_U | I64_DIV_S..=I64_REM_U => self.divide(opcode, h),
            F32_ABS | F32_NEG | F32_COPYSIGN | F64_ABS | F64_NEG | F64_COPYSIGN => self.sign_bits(opcode, h),
            I32_WRAP_I64 | I64_EXTEND_I32_U => {
                let slot = self.operand(h - 1);
                self.asm.load_slot(false, Reg::Rax, slot);
                self.asm.store_slot(slot, Reg::Rax);
            }
            I64_EXTEND_I32_S => {
                let slot = self.operand(h - 1);
                self.asm.movsxd_slot(Reg::Rax, slot);
                self.asm.store_slot(slot, Reg::Rax);
            }
            I32_REINTERPRET_F32 | I64_REINTERPRET_F64 | F32_REINTERPRET_I32 | F64_REINTERPRET_I64 => {}
            _ => {
                let arity = op.signature().0.len();
                let slot = self.operand(h - arity);
                self.call_helper(context::jit_numeric as usize, opcode as u32, slot);
            }
        }
    }

    /// Load the top two operands into `rax` and `rcx`, returning their slots
    fn binary_operands(&mut self, h: usize, wide: bool) -> (i32, i32) {
        let (a, b) = (self.operand(h - 2), self.operand(h - 1));
        self.asm.load_slot(wide, Reg::Rax, a);
        self.asm.load_slot(wide, Reg::Rcx, b);
        (a, b)
    }

    fn float_compare(&mut self, opcode: u8, h: usize) {
        let double = opcode >= F64_EQ;
        let (a, _) = self.binary_operands(h, true);
        let asm = &mut self.asm;
        asm.movq_to_xmm(0, Reg::Rax);
        asm.movq_to_xmm(1, Reg::Rcx);
        // Unordered operands set ZF, PF and CF.
        match if double { opcode - F64_EQ } else { opcode - F32_EQ } {
            0 => {
                asm.ucomis(double, 0, 1);
                asm.setcc(Cond::E, Reg::Rax);
                asm.setcc(Cond::Np, Reg::Rcx);
                asm.alu8(Alu::And, Reg::Rax, Reg::Rcx);
            }
            1 => {
                asm.ucomis(double, 0, 1);
                asm.setcc(Cond::Ne, Reg::Rax);
                asm.setcc(Cond::P, Reg::Rcx);
                asm.alu8(Alu::Or, Reg::Rax, Reg::Rcx);
            }
            2 => {
                asm.ucomis(double, 1, 0);
                asm.setcc(Cond::A, Reg::Rax);
            }
            3 => {
                asm.ucomis(double, 0, 1);
                asm.setcc(Cond::A, Reg::Rax);
            }
            4 => {
                asm.ucomis(double, 1, 0);
                asm.setcc(Cond::Ae, Reg::Rax);
            }
            _ => {
                asm.ucomis(double, 0, 1);
                asm.setcc(Cond::Ae, Reg::Rax);
            }
        }
        asm.movzx8(Reg::Rax, Reg::Rax);
        asm.store_slot(a, Reg::Rax);
    }

    fn divide(&mut self, opcode: u8, h: usize) {
        let wide = opcode >= I64_DIV_S;
        let narrow = if wide { opcode - I64_DIV_S + I32_DIV_S } else { opcode };
        let signed = matches!(narrow, I32_DIV_S | I32_REM_S);
        let remainder = matches!(narrow, I32_REM_S | I32_REM_U);

        let div_zero = self.trap(TrapKind::IntegerDivideByZero);
        let overflow = self.trap(TrapKind::IntegerOverflow);
        let (a, _) = self.binary_operands(h, wide);
        let asm = &mut self.asm;
        let divide = asm.new_label();
        let finished = asm.new_label();

        asm.test(wide, Reg::Rcx, Reg::Rcx);
        asm.jcc(Cond::E, div_zero);
        if signed {
            asm.cmp_imm8(wide, Reg::Rcx, -1);
            asm.jcc(Cond::Ne, divide);
            if remainder {
                // x rem -1 is 0, including for the minimum value
                asm.alu(false, Alu::Xor, Reg::Rdx, Reg::Rdx);
                asm.jmp(finished);
            } else if wide {
                asm.mov_imm64(Reg::Rdx, i64::MIN as u64);
                asm.alu(true, Alu::Cmp, Reg::Rax, Reg::Rdx);
                asm.jcc(Cond::E, overflow);
            } else {
                asm.alu_imm(false, Alu::Cmp, Reg::Rax, i32::MIN as u32);
                asm.jcc(Cond::E, overflow);
            }
        }
        asm.bind(divide);
        if signed {
            asm.sign_extend_rax(wide);
        } else {
            asm.alu(false, Alu::Xor, Reg::Rdx, Reg::Rdx);
        }
        asm.div(wide, signed, Reg::Rcx);
        asm.bind(finished);
        if remainder {
            asm.mov(true, Reg::Rax, Reg::Rdx);
        }
        asm.store_slot(a, Reg::Rax);
    }

    fn sign_bits(&mut self, opcode: u8, h: usize) {
        const F32_SIGN: u32 = 0x8000_0000;
        const F64_SIGN: u64 = 0x8000_0000_0000_0000;

        match opcode {
            F32_ABS | F32_NEG => {
                let slot = self.operand(h - 1);
                self.asm.load_slot(false, Reg::Rax, slot);
                if opcode == F32_ABS {
                    self.asm.alu_imm(false, Alu::And, Reg::Rax, !F32_SIGN);
                } else {
                    self.asm.alu_imm(false, Alu::Xor, Reg::Rax, F32_SIGN);
                }
                self.asm.store_slot(slot, Reg::Rax);
            }
            F64_ABS | F64_NEG => {
                let slot = self.operand(h - 1);
                self.asm.load_slot(true, Reg::Rax, slot);
                if opcode == F64_ABS {
                    self.asm.mov_imm64(Reg::Rcx, !F64_SIGN);
                    self.asm.alu(true, Alu::And, Reg::Rax, Reg::Rcx);
                } else {
                    self.asm.mov_imm64(Reg::Rcx, F64_SIGN);
                    self.asm.alu(true, Alu::Xor, Reg::Rax, Reg::Rcx);
                }
                self.asm.store_slot(slot, Reg::Rax);
            }
            F32_COPYSIGN => {
                let (a, _) = self.binary_operands(h, false);
                self.asm.alu_imm(false, Alu::And, Reg::Rax, !F32_SIGN);
                self.asm.alu_imm(false, Alu::And, Reg::Rcx, F32_SIGN);
                self.asm.alu(false, Alu::Or, Reg::Rax, Reg::Rcx);
                self.asm.store_slot(a, Reg::Rax);
            }
            _ => {
                let (a, _) = self.binary_operands(h, true);
                self.asm.mov_imm64(Reg::Rdx, !F64_SIGN);
                self.asm.alu(true, Alu::And, Reg::Rax, Reg::Rdx);
                self.asm.mov_imm64(Reg::Rdx, F64_SIGN);
                self.asm.alu(true, Alu::And, Reg::Rcx, Reg::Rdx);
                self.asm.alu(true, Alu::Or, Reg::Rax, Reg::Rcx);
                self.asm.store_slot(a, Reg::Rax);
            }
        }
    }
}

/// Condition for the integer comparison at `offset` from `eq`
fn int_condition(offset: u8) -> Cond {
    match offset {
        0 => Cond::E,
        1 => Cond::Ne,
        2 => Cond::L,
        3 => Cond::B,
        4 => Cond::G,
        5 => Cond::A,
        6 => Cond::Le,
        7 => Cond::Be,
        8 => Cond::Ge,
        _ => Cond::Ae,
    }
}

/// Whether a load sign-extends, and whether it extends to 64 bits
fn load_extension(kind: LoadKind) -> (bool, bool) {
    match kind {
        LoadKind::I32S8 | LoadKind::I32S16 => (true, false),
        LoadKind::I64S8 | LoadKind::I64S16 | LoadKind::I64S32 => (true, true),
        LoadKind::I64 | LoadKind::F64 => (false, true),
        _ => (false, false),
    }
}
