//! Encoder for raw function bodies
//!
//! [`CodeBuilder`] writes instructions in the WebAssembly binary encoding, with
//! LEB128 immediates, so modules can be assembled without a decoder.

use super::opcode;
use super::ValueType;

#[derive(Debug, Default, Clone)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        CodeBuilder { bytes: Vec::new() }
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// Append a single opcode with no immediates
    pub fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    /// Append raw bytes, for immediates this builder has no helper for
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn with_u32(mut self, opcode: u8, immediate: u32) -> Self {
        self.bytes.push(opcode);
        self.bytes.extend(emit_vu(immediate as u64));
        self
    }

    fn with_block_type(mut self, opcode: u8, result: Option<ValueType>) -> Self {
        self.bytes.push(opcode);
        self.bytes
            .push(result.map(|t| t.encode()).unwrap_or(opcode::BLOCK_TYPE_EMPTY));
        self
    }

    // Control ------------------------------------------------------------------

    pub fn unreachable(self) -> Self {
        self.op(opcode::UNREACHABLE)
    }

    pub fn block(self, result: Option<ValueType>) -> Self {
        self.with_block_type(opcode::BLOCK, result)
    }

    pub fn loop_(self, result: Option<ValueType>) -> Self {
        self.with_block_type(opcode::LOOP, result)
    }

    pub fn if_(self, result: Option<ValueType>) -> Self {
        self.with_block_type(opcode::IF, result)
    }

    pub fn else_(self) -> Self {
        self.op(opcode::ELSE)
    }

    pub fn end(self) -> Self {
        self.op(opcode::END)
    }

    pub fn br(self, depth: u32) -> Self {
        self.with_u32(opcode::BR, depth)
    }

    pub fn br_if(self, depth: u32) -> Self {
        self.with_u32(opcode::BR_IF, depth)
    }

    pub fn br_table(mut self, depths: &[u32], default: u32) -> Self {
        self.bytes.push(opcode::BR_TABLE);
        self.bytes.extend(emit_vu(depths.len() as u64));
        for depth in depths {
            self.bytes.extend(emit_vu(*depth as u64));
        }
        self.bytes.extend(emit_vu(default as u64));
        self
    }

    pub fn return_(self) -> Self {
        self.op(opcode::RETURN)
    }

    pub fn call(self, function_index: u32) -> Self {
        self.with_u32(opcode::CALL, function_index)
    }

    /// `call_indirect` through table 0
    pub fn call_indirect(mut self, type_index: u32) -> Self {
        self = self.with_u32(opcode::CALL_INDIRECT, type_index);
        self.bytes.push(0x00);
        self
    }

    // Parametric and variable --------------------------------------------------

    pub fn drop(self) -> Self {
        self.op(opcode::DROP)
    }

    pub fn select(self) -> Self {
        self.op(opcode::SELECT)
    }

    pub fn local_get(self, index: u32) -> Self {
        self.with_u32(opcode::LOCAL_GET, index)
    }

    pub fn local_set(self, index: u32) -> Self {
        self.with_u32(opcode::LOCAL_SET, index)
    }

    pub fn local_tee(self, index: u32) -> Self {
        self.with_u32(opcode::LOCAL_TEE, index)
    }

    pub fn global_get(self, index: u32) -> Self {
        self.with_u32(opcode::GLOBAL_GET, index)
    }

    pub fn global_set(self, index: u32) -> Self {
        self.with_u32(opcode::GLOBAL_SET, index)
    }

    // Memory -------------------------------------------------------------------

    /// A load or store opcode with its memarg (alignment hint, then offset)
    pub fn memory(mut self, opcode: u8, align: u32, offset: u32) -> Self {
        self.bytes.push(opcode);
        self.bytes.extend(emit_vu(align as u64));
        self.bytes.extend(emit_vu(offset as u64));
        self
    }

    pub fn memory_size(mut self) -> Self {
        self.bytes.extend([opcode::MEMORY_SIZE, 0x00]);
        self
    }

    pub fn memory_grow(mut self) -> Self {
        self.bytes.extend([opcode::MEMORY_GROW, 0x00]);
        self
    }

    // Constants ----------------------------------------------------------------

    pub fn i32_const(mut self, value: i32) -> Self {
        self.bytes.push(opcode::I32_CONST);
        self.bytes.extend(emit_vs(value as i64));
        self
    }

    pub fn i64_const(mut self, value: i64) -> Self {
        self.bytes.push(opcode::I64_CONST);
        self.bytes.extend(emit_vs(value));
        self
    }

    pub fn f32_const(mut self, value: f32) -> Self {
        self.bytes.push(opcode::F32_CONST);
        self.bytes.extend(value.to_bits().to_le_bytes());
        self
    }

    pub fn f64_const(mut self, value: f64) -> Self {
        self.bytes.push(opcode::F64_CONST);
        self.bytes.extend(value.to_bits().to_le_bytes());
        self
    }
}

/// Unsigned LEB128
pub fn emit_vu(v: u64) -> Vec<u8> {
    let mut result: Vec<u8> = vec![];
    let mut value = v;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            result.push(byte);
            return result;
        }
        result.push(byte | 0x80);
    }
}

/// Signed LEB128
pub fn emit_vs(v: i64) -> Vec<u8> {
    let mut result: Vec<u8> = vec![];
    let mut value = v;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            result.push(byte);
            return result;
        }
        result.push(byte | 0x80);
    }
}
