//! Runtime values for the StackVM.
//!
//! `Value` is everything a program can observe. `Slot` is what arenas and
//! operand stacks hold: either a value or the internal `Vacant` padding that
//! fills reserved-but-unwritten array capacity.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::vm::VmError;

/// Identifies the arena an array lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreId {
    Globals,
    /// Locals of the frame at this call-stack depth (0 is `_entry`).
    Locals(usize),
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreId::Globals => write!(f, "globals"),
            StoreId::Locals(depth) => write!(f, "locals#{}", depth),
        }
    }
}

/// A view onto a contiguous run of slots in exactly one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayRef {
    pub store: StoreId,
    pub offset: usize,
    pub capacity: usize,
    pub length: usize,
}

impl ArrayRef {
    pub fn new(store: StoreId, offset: usize, capacity: usize, length: usize) -> Self {
        Self {
            store,
            offset,
            capacity,
            length,
        }
    }

    /// Absolute arena index of element `index`, bounds checked against capacity.
    pub fn slot_index(&self, index: i64) -> Result<usize, VmError> {
        if index < 0 || index as usize >= self.capacity {
            return Err(VmError::IndexOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(self.offset + index as usize)
    }

    /// Arena range covering the full capacity.
    pub fn span(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.capacity
    }

    pub fn contains(&self, store: StoreId, index: usize) -> bool {
        self.store == store && self.span().contains(&index)
    }
}

/// Runtime values visible to programs and builtins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Double(f64),
    Bool(bool),
    String(String),
    Null,
    Array(ArrayRef),
}

/// One arena or operand-stack cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Slot {
    /// Reserved capacity that has never been written.
    #[default]
    Vacant,
    Value(Value),
}

impl From<Value> for Slot {
    fn from(value: Value) -> Self {
        Slot::Value(value)
    }
}

impl Slot {
    pub fn is_vacant(&self) -> bool {
        matches!(self, Slot::Vacant)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Vacant => None,
        }
    }

    /// Unwrap into a value, failing when the slot was never written.
    pub fn into_value(self, context: &str) -> Result<Value, VmError> {
        match self {
            Slot::Value(v) => Ok(v),
            Slot::Vacant => Err(VmError::TypeError(format!(
                "cannot use an uninitialized value in {}",
                context
            ))),
        }
    }

    pub fn as_array(&self) -> Option<ArrayRef> {
        match self {
            Slot::Value(Value::Array(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayRef> {
        match self {
            Slot::Value(Value::Array(a)) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Vacant => write!(f, "None"),
            Slot::Value(Value::String(s)) => write!(f, "\"{}\"", s),
            Slot::Value(Value::Array(a)) => write!(
                f,
                "Array({} @{}, cap={}, len={})",
                a.store, a.offset, a.capacity, a.length
            ),
            Slot::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Arithmetic operators shared by `ADD` through `POW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

/// Ordering comparisons (`LT`, `LE`, `GT`, `GE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Null => "null",
            Value::Array(_) => "array",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(n) => *n == 0,
            Value::Double(d) => *d == 0.0,
            _ => false,
        }
    }

    /// Apply an arithmetic operator. `Int op Int` stays integral; any
    /// `Double` operand promotes the result to `Double`.
    pub fn arith(&self, op: BinaryOp, rhs: &Value) -> Result<Value, VmError> {
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && rhs.is_zero() {
            return Err(VmError::DivisionByZero);
        }
        if op == BinaryOp::Pow && self.is_zero() && rhs.as_f64().is_some_and(|e| e < 0.0) {
            return Err(VmError::TypeError(
                "cannot raise zero to a negative power".to_string(),
            ));
        }

        fn int_op(op: BinaryOp, x: i32, y: i32) -> Option<i32> {
            match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div => x.checked_div(y),
                BinaryOp::Rem => x.checked_rem(y),
                BinaryOp::Pow => {
                    let r = (x as f64).powf(y as f64).round();
                    if r.is_finite() && r >= i32::MIN as f64 && r <= i32::MAX as f64 {
                        Some(r as i32)
                    } else {
                        None
                    }
                }
            }
        }

        fn float_op(op: BinaryOp, x: f64, y: f64) -> f64 {
            match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
                BinaryOp::Pow => x.powf(y),
            }
        }

        match (self, rhs) {
            (Value::Int(x), Value::Int(y)) => int_op(op, *x, *y)
                .map(Value::Int)
                .ok_or(VmError::ArithmeticOverflow),
            (lhs, rhs) if lhs.is_numeric() && rhs.is_numeric() => {
                let x = lhs.as_f64().unwrap_or_default();
                let y = rhs.as_f64().unwrap_or_default();
                Ok(Value::Double(float_op(op, x, y)))
            }
            _ => Err(VmError::TypeError(format!(
                "arithmetic on non-numeric types: {} and {}",
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    /// `EQ` semantics: numbers compare across kinds, everything else within kind.
    pub fn loosely_equals(&self, rhs: &Value) -> bool {
        match (self, rhs) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (l, r) if l.is_numeric() && r.is_numeric() => l.as_f64() == r.as_f64(),
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }

    /// Ordering comparison; non-numeric operands never satisfy it.
    pub fn compare(&self, op: CompareOp, rhs: &Value) -> bool {
        let ordering = match (self, rhs) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            (l, r) if l.is_numeric() && r.is_numeric() => {
                l.as_f64().and_then(|x| r.as_f64().and_then(|y| x.partial_cmp(&y)))
            }
            _ => None,
        };
        match (op, ordering) {
            (_, None) => false,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }

    /// Ordering used by the `sort` builtin: `Null` first, then within-kind
    /// order. Mismatched kinds compare equal so a stable sort keeps them put.
    pub fn sort_order(&self, rhs: &Value) -> Ordering {
        match (self, rhs) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (l, r) if l.is_numeric() && r.is_numeric() => l
                .as_f64()
                .and_then(|x| r.as_f64().and_then(|y| x.partial_cmp(&y)))
                .unwrap_or(Ordering::Equal),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Double(d) => write!(f, "{:.6}", d),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Null => write!(f, "null"),
            Value::Array(a) => write!(f, "<array {} @{} ({}/{})>", a.store, a.offset, a.length, a.capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_stays_integral() {
        assert_eq!(Value::Int(7).arith(BinaryOp::Add, &Value::Int(5)).unwrap(), Value::Int(12));
        assert_eq!(Value::Int(7).arith(BinaryOp::Div, &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(7).arith(BinaryOp::Rem, &Value::Int(4)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(2).arith(BinaryOp::Pow, &Value::Int(10)).unwrap(), Value::Int(1024));
    }

    #[test]
    fn double_operand_promotes() {
        assert_eq!(
            Value::Int(1).arith(BinaryOp::Add, &Value::Double(0.5)).unwrap(),
            Value::Double(1.5)
        );
        assert_eq!(
            Value::Double(7.5).arith(BinaryOp::Rem, &Value::Int(2)).unwrap(),
            Value::Double(1.5)
        );
    }

    #[test]
    fn division_by_zero_is_an_error_not_infinity() {
        assert!(matches!(
            Value::Int(1).arith(BinaryOp::Div, &Value::Int(0)),
            Err(VmError::DivisionByZero)
        ));
        assert!(matches!(
            Value::Double(1.0).arith(BinaryOp::Div, &Value::Double(0.0)),
            Err(VmError::DivisionByZero)
        ));
        assert!(matches!(
            Value::Double(1.0).arith(BinaryOp::Rem, &Value::Int(0)),
            Err(VmError::DivisionByZero)
        ));
    }

    #[test]
    fn overflow_and_bad_operands() {
        assert!(matches!(
            Value::Int(i32::MAX).arith(BinaryOp::Add, &Value::Int(1)),
            Err(VmError::ArithmeticOverflow)
        ));
        assert!(matches!(
            Value::Int(0).arith(BinaryOp::Pow, &Value::Int(-1)),
            Err(VmError::TypeError(_))
        ));
        assert!(matches!(
            Value::String("a".into()).arith(BinaryOp::Add, &Value::Int(1)),
            Err(VmError::TypeError(_))
        ));
    }

    #[test]
    fn equality_crosses_numeric_kinds_only() {
        assert!(Value::Int(2).loosely_equals(&Value::Double(2.0)));
        assert!(Value::Null.loosely_equals(&Value::Null));
        assert!(!Value::Int(1).loosely_equals(&Value::Bool(true)));
        let arr = Value::Array(ArrayRef::new(StoreId::Globals, 0, 1, 1));
        assert!(!arr.loosely_equals(&arr.clone()));
    }

    #[test]
    fn comparisons_on_non_numbers_are_false() {
        assert!(Value::Int(1).compare(CompareOp::Le, &Value::Int(5)));
        assert!(Value::Double(2.5).compare(CompareOp::Gt, &Value::Int(2)));
        assert!(!Value::String("a".into()).compare(CompareOp::Lt, &Value::String("b".into())));
        assert!(!Value::Null.compare(CompareOp::Ge, &Value::Null));
    }

    #[test]
    fn sort_order_puts_null_first() {
        let mut items = vec![Value::Int(3), Value::Null, Value::Int(1)];
        items.sort_by(|a, b| a.sort_order(b));
        assert_eq!(items, vec![Value::Null, Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::Double(1.5).to_string(), "1.500000");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Slot::Vacant.to_string(), "None");
        assert_eq!(Slot::from(Value::String("hi".into())).to_string(), "\"hi\"");
    }

    #[test]
    fn slot_index_is_bounds_checked() {
        let arr = ArrayRef::new(StoreId::Locals(0), 4, 2, 1);
        assert_eq!(arr.slot_index(1).unwrap(), 5);
        assert!(matches!(arr.slot_index(2), Err(VmError::IndexOutOfRange { index: 2, capacity: 2 })));
        assert!(matches!(arr.slot_index(-1), Err(VmError::IndexOutOfRange { .. })));
    }
}
