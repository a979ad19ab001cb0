//! A minimal x86-64 encoder
//!
//! Only the instruction forms the code generator needs are provided. Branches
//! take a [`Label`] and are emitted with 32-bit displacements that are patched
//! by [`Assembler::finish`].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R12 = 12,
}

impl Reg {
    fn low(self) -> u8 {
        self as u8 & 7
    }
}

/// Condition codes, numbered as in the `Jcc`/`SETcc`/`CMOVcc` opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

/// Two-operand ALU ops, valued as their `op r/m, r` opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0x01,
    Or = 0x09,
    And = 0x21,
    Sub = 0x29,
    Xor = 0x31,
    Cmp = 0x39,
}

impl Alu {
    /// `/digit` of the `81 /digit id` immediate form
    fn extension(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }
}

/// Shifts and rotates by `cl`, valued as their `D3 /digit` extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// Positions of rel32 fields and the label they refer to
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    /// Resolve every branch. `None` if a referenced label was never bound.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0]?;
            let rel = target as i64 - (at as i64 + 4);
            let rel = i32::try_from(rel).ok()?;
            self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Some(self.code)
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    /// REX prefix, omitted when it would carry no bits
    fn rex(&mut self, w: bool, reg: u8, base: u8) {
        let rex = 0x40 | (w as u8) << 3 | (reg >> 3 & 1) << 2 | (base >> 3 & 1);
        if rex != 0x40 {
            self.code.push(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.code.push(mode << 6 | (reg & 7) << 3 | (rm & 7));
    }

    /// `opcode reg, r/m` with a register r/m operand
    fn op_rr(&mut self, w: bool, opcode: &[u8], reg: Reg, rm: Reg) {
        self.rex(w, reg as u8, rm as u8);
        self.emit(opcode);
        self.modrm(0b11, reg as u8, rm as u8);
    }

    /// `opcode reg, [r12 + disp32]`
    fn op_slot(&mut self, w: bool, opcode: &[u8], reg: Reg, disp: i32) {
        self.rex(w, reg as u8, Reg::R12 as u8);
        self.emit(opcode);
        self.modrm(0b10, reg as u8, 0b100);
        self.code.push(0x24);
        self.emit(&disp.to_le_bytes());
    }

    /// `opcode reg, [rdx]`
    fn op_rdx(&mut self, w: bool, opcode: &[u8], reg: Reg) {
        self.rex(w, reg as u8, Reg::Rdx as u8);
        self.emit(opcode);
        self.modrm(0b00, reg as u8, Reg::Rdx.low());
    }

    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8);
        self.code.push(0x50 + reg.low());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8);
        self.code.push(0x58 + reg.low());
    }

    pub fn ret(&mut self) {
        self.code.push(0xc3);
    }

    pub fn int3(&mut self) {
        self.code.push(0xcc);
    }

    pub fn call(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8);
        self.code.push(0xff);
        self.modrm(0b11, 2, reg as u8);
    }

    pub fn mov(&mut self, w: bool, dst: Reg, src: Reg) {
        self.op_rr(w, &[0x89], src, dst);
    }

    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        self.rex(true, 0, dst as u8);
        self.code.push(0xb8 + dst.low());
        self.emit(&imm.to_le_bytes());
    }

    /// Zero-extends into the full register
    pub fn mov_imm32(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, dst as u8);
        self.code.push(0xb8 + dst.low());
        self.emit_u32(imm);
    }

    /// Load a frame slot; the 32-bit form zero-extends
    pub fn load_slot(&mut self, w: bool, dst: Reg, disp: i32) {
        self.op_slot(w, &[0x8b], dst, disp);
    }

    pub fn store_slot(&mut self, disp: i32, src: Reg) {
        self.op_slot(true, &[0x89], src, disp);
    }

    pub fn lea_slot(&mut self, dst: Reg, disp: i32) {
        self.op_slot(true, &[0x8d], dst, disp);
    }

    /// Load the low half of a slot sign-extended to 64 bits
    pub fn movsxd_slot(&mut self, dst: Reg, disp: i32) {
        self.op_slot(true, &[0x63], dst, disp);
    }

    /// `mov dst, [rbx + disp8]`
    pub fn load_rbx(&mut self, dst: Reg, disp: u8) {
        self.rex(true, dst as u8, Reg::Rbx as u8);
        self.code.push(0x8b);
        self.modrm(0b01, dst as u8, Reg::Rbx.low());
        self.code.push(disp);
    }

    /// `cmp reg, [rbx + disp8]`
    pub fn cmp_rbx(&mut self, reg: Reg, disp: u8) {
        self.rex(true, reg as u8, Reg::Rbx as u8);
        self.code.push(0x3b);
        self.modrm(0b01, reg as u8, Reg::Rbx.low());
        self.code.push(disp);
    }

    pub fn alu(&mut self, w: bool, op: Alu, dst: Reg, src: Reg) {
        self.op_rr(w, &[op as u8], src, dst);
    }

    /// `op dst, imm32`; the 64-bit form sign-extends the immediate
    pub fn alu_imm(&mut self, w: bool, op: Alu, dst: Reg, imm: u32) {
        self.rex(w, 0, dst as u8);
        self.code.push(0x81);
        self.modrm(0b11, op.extension(), dst as u8);
        self.emit_u32(imm);
    }

    /// `cmp reg, imm8` with the immediate sign-extended
    pub fn cmp_imm8(&mut self, w: bool, reg: Reg, imm: i8) {
        self.rex(w, 0, reg as u8);
        self.code.push(0x83);
        self.modrm(0b11, Alu::Cmp.extension(), reg as u8);
        self.code.push(imm as u8);
    }

    /// Bytewise `op dst8, src8`; only `al`/`cl`/`dl`/`bl` are addressable
    pub fn alu8(&mut self, op: Alu, dst: Reg, src: Reg) {
        self.code.push(op as u8 - 1);
        self.modrm(0b11, src as u8, dst as u8);
    }

    pub fn test(&mut self, w: bool, a: Reg, b: Reg) {
        self.op_rr(w, &[0x85], b, a);
    }

    pub fn imul(&mut self, w: bool, dst: Reg, src: Reg) {
        self.op_rr(w, &[0x0f, 0xaf], dst, src);
    }

    pub fn shift_cl(&mut self, w: bool, shift: Shift, dst: Reg) {
        self.rex(w, 0, dst as u8);
        self.code.push(0xd3);
        self.modrm(0b11, shift as u8, dst as u8);
    }

    pub fn shr_imm(&mut self, w: bool, dst: Reg, imm: u8) {
        self.rex(w, 0, dst as u8);
        self.code.push(0xc1);
        self.modrm(0b11, Shift::Shr as u8, dst as u8);
        self.code.push(imm);
    }

    /// `cdq` / `cqo`
    pub fn sign_extend_rax(&mut self, w: bool) {
        self.rex(w, 0, 0);
        self.code.push(0x99);
    }

    /// `div` or `idiv` of `rdx:rax` by `src`
    pub fn div(&mut self, w: bool, signed: bool, src: Reg) {
        self.rex(w, 0, src as u8);
        self.code.push(0xf7);
        self.modrm(0b11, if signed { 7 } else { 6 }, src as u8);
    }

    /// Set the low byte of `dst` to the condition; only `al`/`cl`/`dl`/`bl`
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.emit(&[0x0f, 0x90 + cond as u8]);
        self.modrm(0b11, 0, dst as u8);
    }

    /// `movzx dst32, src8`
    pub fn movzx8(&mut self, dst: Reg, src: Reg) {
        self.emit(&[0x0f, 0xb6]);
        self.modrm(0b11, dst as u8, src as u8);
    }

    pub fn cmov(&mut self, w: bool, cond: Cond, dst: Reg, src: Reg) {
        self.op_rr(w, &[0x0f, 0x40 + cond as u8], dst, src);
    }

    /// `movq xmm, r64`
    pub fn movq_to_xmm(&mut self, xmm: u8, src: Reg) {
        self.code.push(0x66);
        self.rex(true, xmm, src as u8);
        self.emit(&[0x0f, 0x6e]);
        self.modrm(0b11, xmm, src as u8);
    }

    /// `ucomiss` / `ucomisd a, b`
    pub fn ucomis(&mut self, double: bool, a: u8, b: u8) {
        if double {
            self.code.push(0x66);
        }
        self.emit(&[0x0f, 0x2e]);
        self.modrm(0b11, a, b);
    }

    /// Load `width` bytes from `[rdx]` into `rax`, sign- or zero-extending
    pub fn load_rdx(&mut self, width: u32, signed: bool, w: bool) {
        match (width, signed) {
            (1, false) => self.op_rdx(false, &[0x0f, 0xb6], Reg::Rax),
            (1, true) => self.op_rdx(w, &[0x0f, 0xbe], Reg::Rax),
            (2, false) => self.op_rdx(false, &[0x0f, 0xb7], Reg::Rax),
            (2, true) => self.op_rdx(w, &[0x0f, 0xbf], Reg::Rax),
            (4, true) if w => self.op_rdx(true, &[0x63], Reg::Rax),
            (4, _) => self.op_rdx(false, &[0x8b], Reg::Rax),
            _ => self.op_rdx(true, &[0x8b], Reg::Rax),
        }
    }

    /// Store the low `width` bytes of `rax` to `[rdx]`
    pub fn store_rdx(&mut self, width: u32) {
        match width {
            1 => self.op_rdx(false, &[0x88], Reg::Rax),
            2 => {
                self.code.push(0x66);
                self.op_rdx(false, &[0x89], Reg::Rax);
            }
            4 => self.op_rdx(false, &[0x89], Reg::Rax),
            _ => self.op_rdx(true, &[0x89], Reg::Rax),
        }
    }

    pub fn jmp(&mut self, label: Label) {
        self.code.push(0xe9);
        self.rel32(label);
    }

    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.emit(&[0x0f, 0x80 + cond as u8]);
        self.rel32(label);
    }

    fn rel32(&mut self, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.emit_u32(0);
    }
}
