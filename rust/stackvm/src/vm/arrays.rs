//! Array instructions and the rules that keep array references valid when
//! values cross frame boundaries.
//!
//! An array never refers to an array in a younger arena. `RET` copies a
//! returned array into the caller's locals; `GSTORE` and `ASTORE` promote a
//! younger array into globals and compact the arena it left.

use super::frame::expected;
use super::{Machine, VmError};
use crate::arena::{store_rank, CopyScope, Moved};
use crate::values::{ArrayRef, Slot, StoreId, Value};

/// Point `array` at its new home after a promotion out of `store`.
///
/// References into a moved span follow the copy. Other references into
/// `store` shift down past every vacated span below them.
fn relink(array: &mut ArrayRef, store: StoreId, moved: &[Moved], vacated: &[(usize, usize)]) {
    if array.store != store {
        return;
    }
    let hit = moved
        .iter()
        .find(|m| m.from.store == store && m.from.span() == array.span())
        .or_else(|| {
            moved
                .iter()
                .find(|m| array.capacity > 0 && m.from.contains(store, array.offset))
        });
    if let Some(m) = hit {
        array.offset = m.to.offset + (array.offset - m.from.offset);
        array.store = m.to.store;
        return;
    }
    let shift: usize = vacated
        .iter()
        .filter(|(offset, _)| *offset < array.offset)
        .map(|(_, capacity)| capacity)
        .sum();
    array.offset -= shift;
}

impl Machine {
    /// `BUILDARR capacity count`, or `BUILDARR count` with the capacity read
    /// from the top of the stack without popping it.
    pub(crate) fn build_array(
        &mut self,
        capacity: Option<usize>,
        count: usize,
    ) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let capacity = match capacity {
            Some(capacity) => capacity,
            None => match stack.peek("BUILDARR")? {
                Slot::Value(Value::Int(n)) if *n >= 0 => *n as usize,
                Slot::Value(other) => return Err(expected("BUILDARR", "a non-negative int", other)),
                Slot::Vacant => {
                    return Err(VmError::TypeError(
                        "cannot use an uninitialized value in BUILDARR".to_string(),
                    ))
                }
            },
        };
        if count > capacity {
            return Err(VmError::ArrayExceedsCapacity {
                length: count,
                capacity,
            });
        }
        let items = stack.pop_many(count, "BUILDARR")?;
        if items.iter().any(Slot::is_vacant) {
            return Err(VmError::TypeError(
                "cannot use an uninitialized value in an array element".to_string(),
            ));
        }
        let target = self.memory.current();
        let array = self.memory.build(items, capacity, target)?;
        self.stack_mut()?.push_value(Value::Array(array))
    }

    /// `CONCAT`: two strings, or two arrays into a fresh array.
    pub(crate) fn concat(&mut self) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let rhs = stack.pop_value("CONCAT")?;
        let lhs = stack.pop_value("CONCAT")?;
        let joined = match (lhs, rhs) {
            (Value::String(mut lhs), Value::String(rhs)) => {
                lhs.push_str(&rhs);
                Value::String(lhs)
            }
            (Value::Array(lhs), Value::Array(rhs)) => {
                let target = self.memory.current();
                Value::Array(self.memory.concat(&lhs, &rhs, target)?)
            }
            (lhs, rhs) => {
                return Err(VmError::TypeError(format!(
                    "CONCAT expected two strings or two arrays, got {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        };
        self.stack_mut()?.push_value(joined)
    }

    /// `COPYARR`: deep copy of the popped array into globals.
    pub(crate) fn copy_array(&mut self) -> Result<(), VmError> {
        let source = self.stack_mut()?.pop_array("COPYARR")?;
        let copy = self
            .memory
            .copy_array(source, StoreId::Globals, CopyScope::All, &mut Vec::new())?;
        self.stack_mut()?.push_value(Value::Array(copy))
    }

    /// `AGET`: pops the index, then the array.
    pub(crate) fn array_get(&mut self) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let index = stack.pop_int("AGET")?;
        let array = stack.pop_array("AGET")?;
        let slot = self.memory.read(&array, i64::from(index))?;
        self.stack_mut()?.push(slot)
    }

    /// `ASTORE`: pops the index, the array, then the value, and pushes the
    /// updated array. Writing to a vacant slot must extend the array by one.
    pub(crate) fn array_store(&mut self) -> Result<(), VmError> {
        let stack = self.stack_mut()?;
        let index = i64::from(stack.pop_int("ASTORE")?);
        let mut array = stack.pop_array("ASTORE")?;
        let at = array.slot_index(index)?;
        let appending = self.memory.store(array.store)?.get(at)?.is_vacant();
        if appending && at != array.length {
            return Err(VmError::UninitializedWrite { index });
        }

        let value = match self.stack_mut()?.pop_value("ASTORE")? {
            Value::Array(inner) if store_rank(inner.store) > store_rank(array.store) => {
                Value::Array(self.promote(inner)?)
            }
            other => other,
        };
        self.memory
            .store_mut(array.store)?
            .set(at, Slot::Value(value))?;
        if appending {
            array.length += 1;
        }
        self.stack_mut()?.push_value(Value::Array(array))
    }

    /// `GSTORE [address]`: overwrite a global, or append one when no address
    /// is given. Arrays not already in globals are promoted first.
    pub(crate) fn global_store(&mut self, address: Option<usize>) -> Result<(), VmError> {
        let slot = match self.stack_mut()?.pop("GSTORE")? {
            Slot::Value(Value::Array(array)) if array.store != StoreId::Globals => {
                Slot::Value(Value::Array(self.promote(array)?))
            }
            other => other,
        };
        let globals = self.memory.globals_mut();
        match address {
            Some(address) => globals.set(address, slot),
            None => globals.push(slot).map(|_| ()),
        }
    }

    /// Move `array` and everything it reaches outside globals into globals,
    /// then close the gaps it left in the current locals.
    pub(crate) fn promote(&mut self, array: ArrayRef) -> Result<ArrayRef, VmError> {
        let mut moved = Vec::new();
        let promoted = self.memory.copy_array(
            array,
            StoreId::Globals,
            CopyScope::Outside(StoreId::Globals),
            &mut moved,
        )?;

        let current = self.memory.current();
        let StoreId::Locals(depth) = current else {
            return Ok(promoted);
        };
        let mut vacated: Vec<(usize, usize)> = moved
            .iter()
            .filter(|m| m.from.store == current && m.from.capacity > 0)
            .map(|m| (m.from.offset, m.from.capacity))
            .collect();
        vacated.sort_unstable();
        vacated.dedup_by_key(|span| span.0);
        if vacated.is_empty() {
            return Ok(promoted);
        }

        self.memory
            .remap_refs(depth, |r| relink(r, current, &moved, &vacated));
        for r in self.frame_mut()?.stack.arrays_mut() {
            relink(r, current, &moved, &vacated);
        }
        let locals = self.memory.current_mut()?;
        for (offset, capacity) in vacated.iter().rev() {
            locals.remove_span(*offset, *capacity);
        }
        tracing::debug!(
            arrays = moved.len(),
            freed = vacated.iter().map(|(_, c)| c).sum::<usize>(),
            from = %current,
            "promoted array to globals"
        );
        Ok(promoted)
    }

    /// Copy an array returned by frame `callee` into its caller's locals.
    pub(crate) fn relocate(&mut self, array: ArrayRef, callee: usize) -> Result<ArrayRef, VmError> {
        let mut moved = Vec::new();
        let target = StoreId::Locals(callee.saturating_sub(1));
        let relocated = self.memory.copy_array(
            array,
            target,
            CopyScope::Within(StoreId::Locals(callee)),
            &mut moved,
        )?;
        tracing::debug!(arrays = moved.len(), to = %relocated.store, "relocated returned array");
        Ok(relocated)
    }
}
