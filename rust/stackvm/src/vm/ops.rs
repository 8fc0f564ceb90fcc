//! Arithmetic, comparison, logic and string operations for the VM.
//!
//! Binary operators pop the right-hand operand first, then the left.

use super::frame::expected;
use super::{Machine, VmError};
use crate::values::{BinaryOp, CompareOp, Value};

fn op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "ADD",
        BinaryOp::Sub => "SUB",
        BinaryOp::Mul => "MUL",
        BinaryOp::Div => "DIV",
        BinaryOp::Rem => "REM",
        BinaryOp::Pow => "POW",
    }
}

/// `Bool` counts as 0/1 for the bitwise operators.
fn bit_operand(op: &'static str, value: &Value) -> Result<i32, VmError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(i32::from(*b)),
        other => Err(expected(op, "int or boolean", other)),
    }
}

impl Machine {
    fn pop_operands(&mut self, op: &'static str) -> Result<(Value, Value), VmError> {
        let stack = self.stack_mut()?;
        let rhs = stack.pop_value(op)?;
        let lhs = stack.pop_value(op)?;
        Ok((lhs, rhs))
    }

    pub(crate) fn arith(&mut self, op: BinaryOp) -> Result<(), VmError> {
        let (lhs, rhs) = self.pop_operands(op_name(op))?;
        let result = lhs.arith(op, &rhs)?;
        self.stack_mut()?.push_value(result)
    }

    pub(crate) fn equality(&mut self, negate: bool) -> Result<(), VmError> {
        let (lhs, rhs) = self.pop_operands(if negate { "NE" } else { "EQ" })?;
        let equal = lhs.loosely_equals(&rhs);
        self.stack_mut()?.push_value(Value::Bool(equal != negate))
    }

    pub(crate) fn compare(&mut self, op: CompareOp) -> Result<(), VmError> {
        let name = match op {
            CompareOp::Lt => "LT",
            CompareOp::Le => "LE",
            CompareOp::Gt => "GT",
            CompareOp::Ge => "GE",
        };
        let (lhs, rhs) = self.pop_operands(name)?;
        self.stack_mut()?.push_value(Value::Bool(lhs.compare(op, &rhs)))
    }

    pub(crate) fn not(&mut self) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let value = stack.pop_bool("NOT")?;
        stack.push_value(Value::Bool(!value))
    }

    pub(crate) fn logic(
        &mut self,
        op: &'static str,
        apply: fn(bool, bool) -> bool,
    ) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let rhs = stack.pop_bool(op)?;
        let lhs = stack.pop_bool(op)?;
        stack.push_value(Value::Bool(apply(lhs, rhs)))
    }

    pub(crate) fn bitwise(&mut self, op: &'static str, apply: fn(i32, i32) -> i32) -> Result<(), VmError> {
        let (lhs, rhs) = self.pop_operands(op)?;
        let result = apply(bit_operand(op, &lhs)?, bit_operand(op, &rhs)?);
        self.stack_mut()?.push_value(Value::Int(result))
    }

    pub(crate) fn repeat_string(&mut self, times: i32) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let value = stack.pop_value("REPEATSTR")?;
        let Value::String(text) = value else {
            return Err(expected("REPEATSTR", "string", &value));
        };
        let repeated = if times <= 0 {
            String::new()
        } else {
            text.repeat(times as usize)
        };
        stack.push_value(Value::String(repeated))
    }
}
