//! WebAssembly table of function references
//!
//! Tables back `call_indirect`. Slots start out null; element segments fill
//! them with function addresses at instantiation. Reading past the end is an
//! `UndefinedElement` trap, calling a null slot is `UninitializedElement`, and
//! the signature check against the call site happens in the engines.

use super::trap::TrapKind;
use crate::error::FormatError;
use crate::module::Limits;
use crate::store::FuncAddr;

/// Most elements a table may be created with
pub const MAX_TABLE_SIZE: u32 = 1 << 24;

#[derive(Debug)]
pub struct Table {
    elements: Vec<Option<FuncAddr>>,
    limits: Limits,
}

impl Table {
    /// Create a table of `limits.min` null references
    pub fn new(limits: Limits) -> Result<Self, FormatError> {
        if limits.min > MAX_TABLE_SIZE {
            return Err(FormatError::InvalidLimits(format!(
                "initial table size {} exceeds maximum {MAX_TABLE_SIZE} elements",
                limits.min
            )));
        }
        let mut elements = Vec::new();
        elements
            .try_reserve_exact(limits.min as usize)
            .map_err(|err| FormatError::InvalidLimits(format!("table {limits}: {err}")))?;
        elements.resize(limits.min as usize, None);
        Ok(Table { elements, limits })
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn limits(&self) -> Limits {
        Limits::new(self.size(), self.limits.max)
    }

    /// Look up a slot for an indirect call
    pub fn get(&self, index: u32) -> Result<FuncAddr, TrapKind> {
        match self.elements.get(index as usize) {
            Some(Some(addr)) => Ok(*addr),
            Some(None) => Err(TrapKind::UninitializedElement),
            None => Err(TrapKind::UndefinedElement),
        }
    }

    /// Whether `len` slots starting at `offset` lie within the table
    pub fn fits(&self, offset: u32, len: usize) -> bool {
        offset as u64 + len as u64 <= self.elements.len() as u64
    }

    /// Write a run of function references starting at `offset`
    pub fn init(&mut self, offset: u32, functions: &[FuncAddr]) -> Result<(), TrapKind> {
        if !self.fits(offset, functions.len()) {
            return Err(TrapKind::UndefinedElement);
        }
        let start = offset as usize;
        for (slot, addr) in self.elements[start..start + functions.len()].iter_mut().zip(functions) {
            *slot = Some(*addr);
        }
        Ok(())
    }
}
