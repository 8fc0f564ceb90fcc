//! Call frames and their operand stacks.

use super::blocks::BlockState;
use super::VmError;
use crate::governor::Limit;
use crate::values::{ArrayRef, Slot, Value};

/// A governed LIFO of slots.
#[derive(Debug, Clone)]
pub struct OperandStack {
    slots: Vec<Slot>,
    limit: Limit,
}

impl OperandStack {
    pub fn new(limit: Limit) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, slot: Slot) -> Result<(), VmError> {
        self.limit.admit(self.slots.len() + 1)?;
        self.slots.push(slot);
        Ok(())
    }

    pub fn push_value(&mut self, value: Value) -> Result<(), VmError> {
        self.push(Slot::Value(value))
    }

    pub fn pop(&mut self, op: &'static str) -> Result<Slot, VmError> {
        self.slots.pop().ok_or(VmError::StackUnderflow(op))
    }

    /// Pop a slot that must hold a value.
    pub fn pop_value(&mut self, op: &'static str) -> Result<Value, VmError> {
        self.pop(op)?.into_value(op)
    }

    pub fn pop_bool(&mut self, op: &'static str) -> Result<bool, VmError> {
        let value = self.pop_value(op)?;
        value.as_bool().ok_or_else(|| expected(op, "boolean", &value))
    }

    pub fn pop_int(&mut self, op: &'static str) -> Result<i32, VmError> {
        let value = self.pop_value(op)?;
        value.as_int().ok_or_else(|| expected(op, "int", &value))
    }

    pub fn pop_array(&mut self, op: &'static str) -> Result<ArrayRef, VmError> {
        match self.pop_value(op)? {
            Value::Array(array) => Ok(array),
            other => Err(expected(op, "array", &other)),
        }
    }

    pub fn peek(&self, op: &'static str) -> Result<&Slot, VmError> {
        self.slots.last().ok_or(VmError::StackUnderflow(op))
    }

    pub fn peek_bool(&self, op: &'static str) -> Result<bool, VmError> {
        match self.peek(op)? {
            Slot::Value(Value::Bool(b)) => Ok(*b),
            Slot::Value(other) => Err(expected(op, "boolean", other)),
            Slot::Vacant => Err(VmError::TypeError(format!(
                "cannot use an uninitialized value in {}",
                op
            ))),
        }
    }

    /// Pop `count` slots, most recently pushed first.
    pub fn pop_many(&mut self, count: usize, op: &'static str) -> Result<Vec<Slot>, VmError> {
        if count > self.slots.len() {
            return Err(VmError::StackUnderflow(op));
        }
        let mut popped = self.slots.split_off(self.slots.len() - count);
        popped.reverse();
        Ok(popped)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn as_slice(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn arrays_mut(&mut self) -> impl Iterator<Item = &mut ArrayRef> {
        self.slots.iter_mut().filter_map(Slot::as_array_mut)
    }
}

pub(crate) fn expected(op: &str, kind: &str, actual: &Value) -> VmError {
    VmError::TypeError(format!(
        "{} expected {}, got {}",
        op,
        kind,
        actual.type_name()
    ))
}

/// One function activation. Its locals arena lives in [`crate::arena::Memory`]
/// at the same depth.
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) function: usize,
    pub(crate) pc: usize,
    pub(crate) return_pc: usize,
    pub(crate) stack: OperandStack,
    pub(crate) blocks: BlockState,
}

impl Frame {
    pub(crate) fn new(function: usize, return_pc: usize, stack_limit: Limit) -> Self {
        Self {
            function,
            pc: 0,
            return_pc,
            stack: OperandStack::new(stack_limit),
            blocks: BlockState::Outside,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn return_pc(&self) -> usize {
        self.return_pc
    }

    pub fn stack(&self) -> &[Slot] {
        self.stack.as_slice()
    }
}
