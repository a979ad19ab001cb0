//! Interpreter call frame

use std::rc::Rc;

use crate::ir::IrFunction;
use crate::store::ModuleInstance;

/// One active guest call.
///
/// Locals occupy `stack[base..base + locals]`, the operand stack follows.
#[derive(Debug)]
pub struct Frame<'s> {
    pub function: Rc<IrFunction>,
    pub instance: &'s ModuleInstance,
    /// Next op to execute once this frame is resumed
    pub pc: usize,
    pub base: usize,
}

impl Frame<'_> {
    /// Stack index of operand height zero
    pub fn operand_base(&self) -> usize {
        self.base + self.function.locals.len()
    }
}
