//! Runtime objects shared by both execution engines
//!
//! Values, linear memory, tables, globals, traps, the interpreter's value
//! stack and the numeric kernel. Memories, tables and globals are reference
//! counted so that an export and all of its importers alias one object.

pub mod global;
pub mod memory;
pub mod ops;
pub mod stack;
pub mod table;
pub mod trap;
pub mod value;

pub use global::Global;
pub use memory::{Memory, PAGE_SIZE};
pub use stack::Stack;
pub use table::{Table, MAX_TABLE_SIZE};
pub use trap::{Trap, TrapKind};
pub use value::Value;

use std::cell::RefCell;
use std::rc::Rc;

pub type SharedMemory = Rc<RefCell<Memory>>;
pub type SharedTable = Rc<RefCell<Table>>;
pub type SharedGlobal = Rc<Global>;
