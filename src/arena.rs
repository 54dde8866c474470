//! Stable-address slot tables backing the epoll and socket descriptor
//! ranges (component C2).
//!
//! Both arenas are thin wrappers over [`slab::Slab`]: a slot index survives
//! until explicitly freed, freed slots are recycled, and nothing ever
//! reallocates an entry out from under a live descriptor. Values are boxed
//! so a descriptor stays valid even while a caller holds a reference across
//! an operation that might grow the slab.

use slab::Slab;

use crate::error::{Result, ShimError};

/// A slab of boxed `T`, indexed by the slot part of a descriptor.
///
/// Every lookup that can't find the slot (either never allocated or freed)
/// reports [`ShimError::BadFd`], matching the shim's single error for "this
/// descriptor doesn't resolve to anything live" regardless of which arena
/// it was meant for.
pub struct SlotTable<T> {
    slots: Slab<Box<T>>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> SlotTable<T> {
        SlotTable::new()
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> SlotTable<T> {
        SlotTable { slots: Slab::new() }
    }

    pub fn with_capacity(capacity: usize) -> SlotTable<T> {
        SlotTable { slots: Slab::with_capacity(capacity) }
    }

    pub fn insert(&mut self, value: T) -> usize {
        self.slots.insert(Box::new(value))
    }

    pub fn remove(&mut self, slot: usize) -> Result<T> {
        if !self.slots.contains(slot) {
            return Err(ShimError::BadFd);
        }
        Ok(*self.slots.remove(slot))
    }

    pub fn get(&self, slot: usize) -> Result<&T> {
        self.slots.get(slot).map(|b| &**b).ok_or(ShimError::BadFd)
    }

    pub fn get_mut(&mut self, slot: usize) -> Result<&mut T> {
        self.slots.get_mut(slot).map(|b| &mut **b).ok_or(ShimError::BadFd)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.slots.contains(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> slab::Iter<'_, Box<T>> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> slab::IterMut<'_, Box<T>> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_slot_reports_badfd() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let slot = table.insert(7);
        assert_eq!(*table.get(slot).unwrap(), 7);
        table.remove(slot).unwrap();
        assert_eq!(table.get(slot).unwrap_err(), ShimError::BadFd);
    }

    #[test]
    fn unknown_slot_reports_badfd() {
        let table: SlotTable<u32> = SlotTable::new();
        assert_eq!(table.get(42).unwrap_err(), ShimError::BadFd);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let a = table.insert(1);
        table.remove(a).unwrap();
        let b = table.insert(2);
        assert_eq!(a, b);
    }
}
