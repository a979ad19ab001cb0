//! Value stack for the interpreter
//!
//! A single `Vec` holds every active frame: each call's locals sit directly
//! below its operands. Function bodies are validated before they run, so an
//! underflow or a mistyped pop means the IR builder is broken, not the guest.

use super::Value;

#[derive(Debug, Default)]
pub struct Stack {
    values: Vec<Value>,
}

impl Stack {
    pub fn with_capacity(capacity: usize) -> Self {
        Stack {
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn push_all(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    pub fn pop(&mut self) -> Value {
        match self.values.pop() {
            Some(value) => value,
            None => unreachable!("operand stack underflow in validated code"),
        }
    }

    /// Pop an operand validated to be an `i32`
    pub fn pop_i32(&mut self) -> i32 {
        match self.pop() {
            Value::I32(v) => v,
            other => unreachable!("expected i32 on the stack, found {other:?}"),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Value {
        self.values[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    /// The top `n` values, bottom first
    pub fn top(&self, n: usize) -> &[Value] {
        &self.values[self.values.len() - n..]
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    /// Remove and return everything from `at` upwards
    pub fn split_off(&mut self, at: usize) -> Vec<Value> {
        self.values.split_off(at)
    }

    /// Discard the values between `height` and the top `arity` values, leaving
    /// those `arity` values at `height`
    pub fn unwind(&mut self, height: usize, arity: usize) {
        let len = self.values.len();
        if len - arity > height {
            self.values.drain(height..len - arity);
        }
    }
}
