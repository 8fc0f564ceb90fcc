//! Slot arenas for locals and globals.
//!
//! An arena is a growable run of [`Slot`]s governed by a [`Limit`]. Arrays
//! are offset views into exactly one arena, so growing the backing `Vec`
//! never invalidates an outstanding [`ArrayRef`].

use crate::config::ResourceLimits;
use crate::governor::{Limit, Resource};
use crate::values::{ArrayRef, Slot, StoreId, Value};
use crate::vm::VmError;

/// A single governed arena.
#[derive(Debug, Clone)]
pub struct Store {
    id: StoreId,
    slots: Vec<Slot>,
    limit: Limit,
}

impl Store {
    pub fn new(id: StoreId, limit: Limit) -> Self {
        Self {
            id,
            slots: Vec::new(),
            limit,
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    pub fn get(&self, index: usize) -> Result<&Slot, VmError> {
        self.slots.get(index).ok_or(VmError::AddressOutOfRange {
            store: self.id,
            index,
            len: self.slots.len(),
        })
    }

    /// Overwrite an existing slot.
    pub fn set(&mut self, index: usize, slot: Slot) -> Result<(), VmError> {
        let len = self.slots.len();
        let target = self.slots.get_mut(index).ok_or(VmError::AddressOutOfRange {
            store: self.id,
            index,
            len,
        })?;
        *target = slot;
        Ok(())
    }

    /// Append a slot at the high-water mark, returning its address.
    pub fn push(&mut self, slot: Slot) -> Result<usize, VmError> {
        self.limit.admit(self.slots.len() + 1)?;
        self.slots.push(slot);
        Ok(self.slots.len() - 1)
    }

    /// Whether `count` more slots fit under the hard ceiling.
    pub fn fits(&self, count: usize) -> bool {
        self.limit.fits(self.slots.len() + count)
    }

    /// Reserve `count` vacant slots, returning the offset of the first.
    pub fn reserve(&mut self, count: usize) -> Result<usize, VmError> {
        let offset = self.slots.len();
        self.limit.admit(offset + count)?;
        self.slots.resize(offset + count, Slot::Vacant);
        Ok(offset)
    }

    fn check_span(&self, array: &ArrayRef) -> Result<(), VmError> {
        if array.store != self.id {
            return Err(VmError::Fault(format!(
                "array in {} resolved against {}",
                array.store, self.id
            )));
        }
        if array.offset + array.capacity > self.slots.len() {
            return Err(VmError::AddressOutOfRange {
                store: self.id,
                index: array.offset + array.capacity,
                len: self.slots.len(),
            });
        }
        Ok(())
    }

    /// All slots backing `array`, including vacant capacity.
    pub fn span(&self, array: &ArrayRef) -> Result<&[Slot], VmError> {
        self.check_span(array)?;
        Ok(&self.slots[array.span()])
    }

    pub fn span_mut(&mut self, array: &ArrayRef) -> Result<&mut [Slot], VmError> {
        self.check_span(array)?;
        Ok(&mut self.slots[array.span()])
    }

    /// Remove `count` slots at `offset`, shifting later slots down.
    pub(crate) fn remove_span(&mut self, offset: usize, count: usize) {
        let end = (offset + count).min(self.slots.len());
        if offset < end {
            self.slots.drain(offset..end);
        }
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }
}

/// Which nested arrays a deep copy follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyScope {
    /// Every nested array.
    All,
    /// Only nested arrays living in this store.
    Within(StoreId),
    /// Only nested arrays living outside this store.
    Outside(StoreId),
}

impl CopyScope {
    fn follows(&self, store: StoreId) -> bool {
        match self {
            CopyScope::All => true,
            CopyScope::Within(id) => *id == store,
            CopyScope::Outside(id) => *id != store,
        }
    }
}

/// Records a source array and where its contents were copied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moved {
    pub from: ArrayRef,
    pub to: ArrayRef,
}

/// Globals plus one locals arena per live frame.
#[derive(Debug, Clone)]
pub struct Memory {
    globals: Store,
    locals: Vec<Store>,
    locals_limit: Limit,
    heap_backup: bool,
}

impl Memory {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            globals: Store::new(
                StoreId::Globals,
                Limit::from_limits(Resource::Globals, limits),
            ),
            locals: Vec::new(),
            locals_limit: Limit::from_limits(Resource::Locals, limits),
            heap_backup: limits.heap_storage_backup,
        }
    }

    pub fn globals(&self) -> &Store {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Store {
        &mut self.globals
    }

    /// Locals of the frame at `depth`.
    pub fn locals(&self, depth: usize) -> Option<&Store> {
        self.locals.get(depth)
    }

    /// Locals of the innermost frame.
    pub fn current_mut(&mut self) -> Result<&mut Store, VmError> {
        self.locals
            .last_mut()
            .ok_or_else(|| VmError::Fault("no active frame".to_string()))
    }

    /// Store id of the innermost frame's locals.
    pub fn current(&self) -> StoreId {
        StoreId::Locals(self.locals.len().saturating_sub(1))
    }

    /// Open a locals arena for a new frame, seeded with its arguments.
    pub(crate) fn push_frame(&mut self, args: Vec<Slot>) -> Result<(), VmError> {
        let mut store = Store::new(StoreId::Locals(self.locals.len()), self.locals_limit);
        for arg in args {
            store.push(arg)?;
        }
        self.locals.push(store);
        Ok(())
    }

    pub(crate) fn pop_frame(&mut self) {
        self.locals.pop();
    }

    pub fn store(&self, id: StoreId) -> Result<&Store, VmError> {
        match id {
            StoreId::Globals => Ok(&self.globals),
            StoreId::Locals(depth) => self.locals.get(depth).ok_or(VmError::DanglingArray(id)),
        }
    }

    pub fn store_mut(&mut self, id: StoreId) -> Result<&mut Store, VmError> {
        match id {
            StoreId::Globals => Ok(&mut self.globals),
            StoreId::Locals(depth) => self
                .locals
                .get_mut(depth)
                .ok_or(VmError::DanglingArray(id)),
        }
    }

    /// Every slot backing `array`.
    pub fn span(&self, array: &ArrayRef) -> Result<&[Slot], VmError> {
        self.store(array.store)?.span(array)
    }

    /// The initialized prefix of `array` as values.
    pub fn elements(&self, array: &ArrayRef) -> Result<Vec<Value>, VmError> {
        self.span(array)?
            .iter()
            .take(array.length)
            .map(|slot| slot.clone().into_value("array element"))
            .collect()
    }

    pub fn read(&self, array: &ArrayRef, index: i64) -> Result<Slot, VmError> {
        let at = array.slot_index(index)?;
        Ok(self.store(array.store)?.get(at)?.clone())
    }

    /// Reserve `capacity` slots near `target`. When `target` is a locals
    /// arena that cannot take them and heap backup is on, globals are used.
    pub fn allocate(&mut self, capacity: usize, target: StoreId) -> Result<ArrayRef, VmError> {
        let heap_backup = self.heap_backup;
        let primary = self.store_mut(target)?;
        if primary.fits(capacity) || target == StoreId::Globals || !heap_backup {
            let offset = primary.reserve(capacity)?;
            return Ok(ArrayRef::new(target, offset, capacity, 0));
        }
        let locals_max = primary.limit().hard();
        if !self.globals.fits(capacity) {
            return Err(VmError::HeapExhausted {
                locals: locals_max,
                globals: self.globals.limit().hard(),
            });
        }
        tracing::info!(
            capacity,
            from = %target,
            "locals exhausted, placing array in globals"
        );
        let offset = self.globals.reserve(capacity)?;
        Ok(ArrayRef::new(StoreId::Globals, offset, capacity, 0))
    }

    /// Allocate an array of `capacity` holding `items`, padded with vacant slots.
    pub fn build(
        &mut self,
        items: Vec<Slot>,
        capacity: usize,
        target: StoreId,
    ) -> Result<ArrayRef, VmError> {
        if items.len() > capacity {
            return Err(VmError::ArrayExceedsCapacity {
                length: items.len(),
                capacity,
            });
        }
        let mut array = self.allocate(capacity, target)?;
        array.length = items.len();
        let mut settled = Vec::with_capacity(items.len());
        for item in items {
            settled.push(match item {
                Slot::Value(value) => Slot::Value(self.settle(value, &array)?),
                Slot::Vacant => Slot::Vacant,
            });
        }
        let span = self.store_mut(array.store)?.span_mut(&array)?;
        for (dst, item) in span.iter_mut().zip(settled) {
            *dst = item;
        }
        Ok(array)
    }

    /// Make `item` safe to hold inside `holder`: an array living in a
    /// younger arena than `holder` is copied into globals.
    pub fn settle(&mut self, item: Value, holder: &ArrayRef) -> Result<Value, VmError> {
        match item {
            Value::Array(inner) if store_rank(inner.store) > store_rank(holder.store) => {
                let copy = self.copy_array(
                    inner,
                    StoreId::Globals,
                    CopyScope::Outside(StoreId::Globals),
                    &mut Vec::new(),
                )?;
                Ok(Value::Array(copy))
            }
            other => Ok(other),
        }
    }

    /// Copy `source` and the nested arrays selected by `scope` into `target`.
    /// Each copy is recorded in `moved`; an array reachable twice is copied once.
    /// Arrays are identified by offset and capacity, since an empty array
    /// shares its offset with the next array in the same store.
    pub fn copy_array(
        &mut self,
        source: ArrayRef,
        target: StoreId,
        scope: CopyScope,
        moved: &mut Vec<Moved>,
    ) -> Result<ArrayRef, VmError> {
        if let Some(done) = moved
            .iter()
            .find(|m| m.from.store == source.store && m.from.span() == source.span())
        {
            return Ok(ArrayRef {
                length: source.length,
                ..done.to
            });
        }
        let mut contents = self.span(&source)?.to_vec();
        let mut dest = self.allocate(source.capacity, target)?;
        dest.length = source.length;
        moved.push(Moved {
            from: source,
            to: dest,
        });
        for slot in contents.iter_mut() {
            if let Some(inner) = slot.as_array_mut() {
                if scope.follows(inner.store) {
                    *inner = self.copy_array(*inner, target, scope, moved)?;
                }
            }
        }
        let span = self.store_mut(dest.store)?.span_mut(&dest)?;
        span.clone_from_slice(&contents);
        Ok(dest)
    }

    /// Copy the live elements of `lhs` then `rhs` into a new array whose
    /// capacity is the sum of both capacities.
    pub fn concat(
        &mut self,
        lhs: &ArrayRef,
        rhs: &ArrayRef,
        target: StoreId,
    ) -> Result<ArrayRef, VmError> {
        let mut items: Vec<Slot> = self.span(lhs)?[..lhs.length].to_vec();
        items.extend_from_slice(&self.span(rhs)?[..rhs.length]);
        self.build(items, lhs.capacity + rhs.capacity, target)
    }

    /// Copy `[start, end)` of `array` into a new array with the same capacity.
    pub fn slice(
        &mut self,
        array: &ArrayRef,
        start: i64,
        end: i64,
        target: StoreId,
    ) -> Result<ArrayRef, VmError> {
        let length = array.length as i64;
        if start < 0 || start > end || start >= length || end > length {
            return Err(VmError::SliceOutOfRange {
                start,
                end,
                length: array.length,
            });
        }
        let items = self.span(array)?[start as usize..end as usize].to_vec();
        self.build(items, array.capacity, target)
    }

    /// Rewrite every array reference held in globals and the given locals.
    pub(crate) fn remap_refs<F>(&mut self, depth: usize, mut remap: F)
    where
        F: FnMut(&mut ArrayRef),
    {
        let stores = std::iter::once(&mut self.globals).chain(self.locals.get_mut(depth));
        for store in stores {
            for slot in store.slots_mut() {
                if let Some(array) = slot.as_array_mut() {
                    remap(array);
                }
            }
        }
    }
}

/// Relative age of a store: globals are oldest, deeper frames are younger.
pub(crate) fn store_rank(id: StoreId) -> usize {
    match id {
        StoreId::Globals => 0,
        StoreId::Locals(depth) => depth + 1,
    }
}
