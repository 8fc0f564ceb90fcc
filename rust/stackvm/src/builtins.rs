//! Builtin function dispatch.
//!
//! `CALL` consults the dispatcher before the program's own functions. A
//! builtin receives its arguments in pop order (the last value pushed is
//! `args[0]`) together with mutable access to both arenas, and returns at
//! most one value for the caller's operand stack.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::arena::Memory;
use crate::values::{ArrayRef, Slot, Value};
use crate::vm::VmError;

/// Host-provided builtin functions.
pub trait BuiltinDispatcher {
    /// Whether `name` is handled here rather than by the program.
    fn is_builtin(&self, name: &str) -> bool;

    /// Run builtin `name`. `Ok(None)` pushes nothing.
    fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        memory: &mut Memory,
    ) -> Result<Option<Value>, VmError>;
}

/// Dispatcher with no builtins; every `CALL` resolves against the program.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBuiltins;

impl BuiltinDispatcher for NoBuiltins {
    fn is_builtin(&self, _name: &str) -> bool {
        false
    }

    fn call(
        &mut self,
        name: &str,
        _args: Vec<Value>,
        _memory: &mut Memory,
    ) -> Result<Option<Value>, VmError> {
        Err(VmError::UnknownFunction(name.to_string()))
    }
}

/// Captured program output, shared between a [`Stdlib`] and its owner.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    inner: Rc<RefCell<Captured>>,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: String,
    stderr: String,
}

impl OutputBuffer {
    pub fn stdout(&self) -> String {
        self.inner.borrow().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.inner.borrow().stderr.clone()
    }

    /// Captured stdout split into lines.
    pub fn lines(&self) -> Vec<String> {
        self.inner.borrow().stdout.lines().map(String::from).collect()
    }
}

#[derive(Debug, Clone)]
enum Console {
    Stdio,
    Capture(OutputBuffer),
}

impl Console {
    fn out(&self, text: &str) -> Result<(), VmError> {
        match self {
            Console::Stdio => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(text.as_bytes())
                    .and_then(|_| stdout.flush())
                    .map_err(|e| VmError::FileError(e.to_string()))
            }
            Console::Capture(buffer) => {
                buffer.inner.borrow_mut().stdout.push_str(text);
                Ok(())
            }
        }
    }

    fn err(&self, text: &str) -> Result<(), VmError> {
        match self {
            Console::Stdio => std::io::stderr()
                .write_all(text.as_bytes())
                .map_err(|e| VmError::FileError(e.to_string())),
            Console::Capture(buffer) => {
                buffer.inner.borrow_mut().stderr.push_str(text);
                Ok(())
            }
        }
    }
}

const NAMES: &[&str] = &[
    "print",
    "println",
    "printerr",
    "getType",
    "toString",
    "_length_a",
    "capacity",
    "max",
    "min",
    "_slice_a",
    "append",
    "prepend",
    "insert",
    "_remove_indx_a",
    "_remove_val_a",
    "_remove_all_val_a",
    "_contains_a",
    "indexOf",
    "_reverse_a",
    "sort",
];

/// Console and array builtins.
#[derive(Debug, Clone)]
pub struct Stdlib {
    console: Console,
}

impl Default for Stdlib {
    fn default() -> Self {
        Self::new()
    }
}

impl Stdlib {
    /// Builtins writing to the process's stdout and stderr.
    pub fn new() -> Self {
        Self {
            console: Console::Stdio,
        }
    }

    /// Builtins writing into `buffer`.
    pub fn capturing(buffer: OutputBuffer) -> Self {
        Self {
            console: Console::Capture(buffer),
        }
    }
}

fn arity(name: &str, args: &[Value], expected: &[usize]) -> Result<(), VmError> {
    if expected.contains(&args.len()) {
        return Ok(());
    }
    let wanted = expected
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(VmError::Arity {
        name: name.to_string(),
        expected: wanted,
        got: args.len(),
    })
}

fn array_arg(name: &str, value: &Value) -> Result<ArrayRef, VmError> {
    match value {
        Value::Array(array) => Ok(*array),
        other => Err(VmError::TypeError(format!(
            "{} expected array, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn int_arg(name: &str, value: &Value) -> Result<i64, VmError> {
    value.as_int().map(i64::from).ok_or_else(|| {
        VmError::TypeError(format!("{} expected int, got {}", name, value.type_name()))
    })
}

/// Render a value the way `print` shows it.
pub fn render(value: &Value, memory: &Memory) -> Result<String, VmError> {
    render_nested(value, memory, 0)
}

fn render_nested(value: &Value, memory: &Memory, depth: usize) -> Result<String, VmError> {
    let Value::Array(array) = value else {
        return Ok(value.to_string());
    };
    if depth > 16 {
        return Ok("[...]".to_string());
    }
    let items = memory
        .elements(array)?
        .iter()
        .map(|item| render_nested(item, memory, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("[{}]", items.join(", ")))
}

/// `getType` name, with the element type for arrays (`Array<int>`).
pub fn type_name(value: &Value, memory: &Memory) -> Result<String, VmError> {
    type_name_nested(value, memory, 0)
}

fn type_name_nested(value: &Value, memory: &Memory, depth: usize) -> Result<String, VmError> {
    let Value::Array(array) = value else {
        return Ok(value.type_name().to_string());
    };
    if depth > 16 {
        return Ok("Array<...>".to_string());
    }
    match memory.elements(array)?.first() {
        None => Ok("Array<>".to_string()),
        Some(first) => Ok(format!(
            "Array<{}>",
            type_name_nested(first, memory, depth + 1)?
        )),
    }
}

fn ensure_room(array: &ArrayRef) -> Result<(), VmError> {
    if array.length >= array.capacity {
        return Err(VmError::ArrayFull {
            capacity: array.capacity,
        });
    }
    Ok(())
}

/// Insert `item` at `index` within the live range, shifting later elements up.
fn insert_at(
    memory: &mut Memory,
    mut array: ArrayRef,
    index: i64,
    item: Value,
) -> Result<ArrayRef, VmError> {
    ensure_room(&array)?;
    if index < 0 || index as usize > array.length {
        return Err(VmError::IndexOutOfRange {
            index,
            capacity: array.length,
        });
    }
    let item = memory.settle(item, &array)?;
    let at = index as usize;
    let span = memory.store_mut(array.store)?.span_mut(&array)?;
    span[at..=array.length].rotate_right(1);
    span[at] = Slot::Value(item);
    array.length += 1;
    Ok(array)
}

/// Remove the element at `index`, shifting later elements down.
fn remove_at(memory: &mut Memory, mut array: ArrayRef, index: usize) -> Result<ArrayRef, VmError> {
    if index >= array.length {
        return Err(VmError::IndexOutOfRange {
            index: index as i64,
            capacity: array.length,
        });
    }
    let span = memory.store_mut(array.store)?.span_mut(&array)?;
    span[index..array.length].rotate_left(1);
    span[array.length - 1] = Slot::Vacant;
    array.length -= 1;
    Ok(array)
}

fn position(memory: &Memory, array: &ArrayRef, needle: &Value) -> Result<Option<usize>, VmError> {
    Ok(memory
        .elements(array)?
        .iter()
        .position(|item| item.loosely_equals(needle)))
}

impl BuiltinDispatcher for Stdlib {
    fn is_builtin(&self, name: &str) -> bool {
        NAMES.contains(&name)
    }

    fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        memory: &mut Memory,
    ) -> Result<Option<Value>, VmError> {
        match name {
            "print" => {
                arity(name, &args, &[1])?;
                self.console.out(&render(&args[0], memory)?)?;
                Ok(None)
            }
            "println" => {
                arity(name, &args, &[0, 1])?;
                let text = match args.first() {
                    Some(value) => render(value, memory)?,
                    None => String::new(),
                };
                self.console.out(&format!("{}\n", text))?;
                Ok(None)
            }
            "printerr" => {
                arity(name, &args, &[1])?;
                self.console.err(&format!("{}\n", render(&args[0], memory)?))?;
                Ok(None)
            }
            "getType" => {
                arity(name, &args, &[1])?;
                Ok(Some(Value::String(type_name(&args[0], memory)?)))
            }
            "toString" => {
                arity(name, &args, &[1])?;
                Ok(Some(Value::String(render(&args[0], memory)?)))
            }
            "_length_a" => {
                arity(name, &args, &[1])?;
                let array = array_arg(name, &args[0])?;
                Ok(Some(Value::Int(array.length as i32)))
            }
            "capacity" => {
                arity(name, &args, &[1])?;
                let array = array_arg(name, &args[0])?;
                Ok(Some(Value::Int(array.capacity as i32)))
            }
            "max" | "min" => {
                arity(name, &args, &[2])?;
                let (a, b) = (&args[0], &args[1]);
                let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                    return Err(VmError::TypeError(format!(
                        "{} expected numbers, got {} and {}",
                        name,
                        a.type_name(),
                        b.type_name()
                    )));
                };
                let first = if name == "max" { x >= y } else { x <= y };
                Ok(Some(if first { a.clone() } else { b.clone() }))
            }
            "_slice_a" => {
                arity(name, &args, &[2, 3])?;
                let array = array_arg(name, &args[0])?;
                let start = int_arg(name, &args[1])?;
                let end = match args.get(2) {
                    Some(v) => int_arg(name, v)?,
                    None => array.length as i64,
                };
                let target = memory.current();
                Ok(Some(Value::Array(memory.slice(&array, start, end, target)?)))
            }
            "append" => {
                arity(name, &args, &[2])?;
                let array = array_arg(name, &args[0])?;
                let at = array.length as i64;
                let updated = insert_at(memory, array, at, args[1].clone())?;
                Ok(Some(Value::Array(updated)))
            }
            "prepend" => {
                arity(name, &args, &[2])?;
                let array = array_arg(name, &args[0])?;
                let updated = insert_at(memory, array, 0, args[1].clone())?;
                Ok(Some(Value::Array(updated)))
            }
            "insert" => {
                arity(name, &args, &[3])?;
                let array = array_arg(name, &args[0])?;
                let index = int_arg(name, &args[2])?;
                let updated = insert_at(memory, array, index, args[1].clone())?;
                Ok(Some(Value::Array(updated)))
            }
            "_remove_indx_a" => {
                arity(name, &args, &[2])?;
                let array = array_arg(name, &args[0])?;
                let index = int_arg(name, &args[1])?;
                let index = usize::try_from(index).map_err(|_| VmError::IndexOutOfRange {
                    index,
                    capacity: array.length,
                })?;
                Ok(Some(Value::Array(remove_at(memory, array, index)?)))
            }
            "_remove_val_a" => {
                arity(name, &args, &[2])?;
                let mut array = array_arg(name, &args[0])?;
                if let Some(index) = position(memory, &array, &args[1])? {
                    array = remove_at(memory, array, index)?;
                }
                Ok(Some(Value::Array(array)))
            }
            "_remove_all_val_a" => {
                arity(name, &args, &[2])?;
                let mut array = array_arg(name, &args[0])?;
                while let Some(index) = position(memory, &array, &args[1])? {
                    array = remove_at(memory, array, index)?;
                }
                Ok(Some(Value::Array(array)))
            }
            "_contains_a" => {
                arity(name, &args, &[2])?;
                let array = array_arg(name, &args[0])?;
                Ok(Some(Value::Bool(position(memory, &array, &args[1])?.is_some())))
            }
            "indexOf" => {
                arity(name, &args, &[2])?;
                let array = array_arg(name, &args[0])?;
                let index = position(memory, &array, &args[1])?.map_or(-1, |i| i as i32);
                Ok(Some(Value::Int(index)))
            }
            "_reverse_a" => {
                arity(name, &args, &[1])?;
                let array = array_arg(name, &args[0])?;
                memory.store_mut(array.store)?.span_mut(&array)?[..array.length].reverse();
                Ok(Some(Value::Array(array)))
            }
            "sort" => {
                arity(name, &args, &[1])?;
                let array = array_arg(name, &args[0])?;
                let mut items = memory.elements(&array)?;
                items.sort_by(|a, b| a.sort_order(b));
                let span = memory.store_mut(array.store)?.span_mut(&array)?;
                for (slot, item) in span.iter_mut().zip(items) {
                    *slot = Slot::Value(item);
                }
                Ok(None)
            }
            other => Err(VmError::UnknownFunction(other.to_string())),
        }
    }
}
