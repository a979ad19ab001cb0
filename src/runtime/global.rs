//! Global variable cells
//!
//! Globals are shared by `Rc` so that an exported mutable global and every
//! importer alias the same cell.

use super::Value;
use crate::module::GlobalType;
use std::cell::Cell;

#[derive(Debug)]
pub struct Global {
    global_type: GlobalType,
    value: Cell<Value>,
}

impl Global {
    pub fn new(global_type: GlobalType, value: Value) -> Self {
        Global {
            global_type,
            value: Cell::new(value),
        }
    }

    pub fn global_type(&self) -> GlobalType {
        self.global_type
    }

    pub fn get(&self) -> Value {
        self.value.get()
    }

    /// Store a new value; the caller has already checked mutability and type
    pub fn set(&self, value: Value) {
        debug_assert_eq!(value.typ(), self.global_type.value_type);
        self.value.set(value);
    }
}
