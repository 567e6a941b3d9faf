//! Fixed-capacity, identifier-indexed object pool.
//!
//! [`Pool`] stores fully constructed values contiguously in `[0, len)` and
//! never reallocates past the capacity it was created with. Values are keyed
//! by a caller-assigned string identifier ([`Identified::id`]); lookups by id
//! are linear scans in storage order.
//!
//! Deletion swap-removes: the last value moves into the freed storage index.
//! Anything that needs to refer to a pooled value across frames should hold a
//! [`PoolHandle`] rather than an index. Handles go through an indirection
//! table of slots with generation counters, so they survive swap-removal and
//! stop resolving once their value is deleted.
//!
//! ```
//! use realware::pool::{Identified, Pool};
//!
//! struct Sound { id: String }
//! impl Identified for Sound {
//!     fn id(&self) -> &str { &self.id }
//! }
//!
//! let mut sounds = Pool::new("sounds", 4);
//! let hit = sounds.add(Sound { id: "hit".into() }).unwrap();
//! sounds.add(Sound { id: "jump".into() }).unwrap();
//! sounds.delete("hit");
//! assert!(sounds.get(hit).is_none());
//! assert_eq!(sounds.index_of("jump"), Some(0));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{RenderError, RenderResult};

/// Values stored in a [`Pool`] expose their unique identifier.
pub trait Identified {
    fn id(&self) -> &str;
}

/// Stable reference to a value in a [`Pool`].
///
/// Resolving a handle after its value was deleted returns `None`, even if
/// the slot has since been reused.
pub struct PoolHandle<T> {
    slot: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolHandle<T> {
    fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolHandle<T> {}

impl<T> PartialEq for PoolHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for PoolHandle<T> {}

impl<T> Hash for PoolHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHandle({}v{})", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    /// Storage index of the value, `None` while the slot is free.
    index: Option<u32>,
}

pub struct Pool<T> {
    name: &'static str,
    capacity: usize,
    items: Vec<T>,
    /// Slot owning each storage index; parallel to `items`.
    item_slots: Vec<u32>,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
}

impl<T: Identified> Pool<T> {
    /// Creates an empty pool. `name` shows up in capacity errors and logs.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Vec::with_capacity(capacity),
            item_slots: Vec::with_capacity(capacity),
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Stores `value` at index `len()`.
    ///
    /// Fails without modifying the pool when it is full or when the value's
    /// identifier is already live.
    pub fn add(&mut self, value: T) -> RenderResult<PoolHandle<T>> {
        if self.items.len() >= self.capacity {
            log::error!(
                "{} is full (capacity {}), cannot add '{}'",
                self.name,
                self.capacity,
                value.id()
            );
            return Err(RenderError::CapacityExceeded {
                pool: self.name,
                capacity: self.capacity,
            });
        }
        if self.index_of(value.id()).is_some() {
            log::error!("{} already contains '{}'", self.name, value.id());
            return Err(RenderError::DuplicateId(value.id().to_string()));
        }

        let index = self.items.len() as u32;
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize].index = Some(index);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    index: Some(index),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.items.push(value);
        self.item_slots.push(slot);
        Ok(PoolHandle::new(slot, self.slots[slot as usize].generation))
    }

    pub fn find(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    /// Current storage index of `id`. Invalidated by any deletion.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    /// Handle for the live value with identifier `id`.
    pub fn handle_of(&self, id: &str) -> Option<PoolHandle<T>> {
        let index = self.index_of(id)?;
        Some(self.handle_at(index))
    }

    fn handle_at(&self, index: usize) -> PoolHandle<T> {
        let slot = self.item_slots[index];
        PoolHandle::new(slot, self.slots[slot as usize].generation)
    }

    fn resolve(&self, handle: PoolHandle<T>) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.index.map(|index| index as usize)
    }

    pub fn get(&self, handle: PoolHandle<T>) -> Option<&T> {
        let index = self.resolve(handle)?;
        self.items.get(index)
    }

    pub fn get_mut(&mut self, handle: PoolHandle<T>) -> Option<&mut T> {
        let index = self.resolve(handle)?;
        self.items.get_mut(index)
    }

    pub fn contains(&self, handle: PoolHandle<T>) -> bool {
        self.resolve(handle).is_some()
    }

    /// Swap-removes the value with identifier `id`. Absent ids are a no-op.
    pub fn delete(&mut self, id: &str) -> Option<T> {
        let index = self.index_of(id)?;
        Some(self.remove_at(index))
    }

    /// Swap-removes the value behind `handle`, if it is still live.
    pub fn remove(&mut self, handle: PoolHandle<T>) -> Option<T> {
        let index = self.resolve(handle)?;
        Some(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> T {
        let freed = self.item_slots.swap_remove(index);
        let value = self.items.swap_remove(index);

        // The former last value now lives at `index`.
        if let Some(&moved) = self.item_slots.get(index) {
            self.slots[moved as usize].index = Some(index as u32);
        }

        let slot = &mut self.slots[freed as usize];
        slot.index = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(freed);

        value
    }

    pub fn clear(&mut self) {
        while !self.items.is_empty() {
            self.remove_at(self.items.len() - 1);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live values in storage order.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Live values paired with their handles, in storage order.
    pub fn iter_with_handles(&self) -> impl Iterator<Item = (PoolHandle<T>, &T)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| (self.handle_at(index), item))
    }
}

impl<'a, T: Identified> IntoIterator for &'a Pool<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Identified + fmt::Debug> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("items", &self.items)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item {
        id: String,
        value: i32,
    }

    impl Identified for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, value: i32) -> Item {
        Item {
            id: id.to_string(),
            value,
        }
    }

    fn ids(pool: &Pool<Item>) -> Vec<&str> {
        pool.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn add_until_full() {
        let mut pool = Pool::new("items", 3);
        for i in 0..3 {
            pool.add(item(&format!("i{i}"), i)).unwrap();
            assert_eq!(pool.len(), i as usize + 1);
        }

        let err = pool.add(item("overflow", 9)).unwrap_err();
        assert!(matches!(
            err,
            RenderError::CapacityExceeded {
                pool: "items",
                capacity: 3
            }
        ));
        assert_eq!(pool.len(), 3);
        assert!(pool.find("overflow").is_none());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut pool = Pool::new("items", 3);
        pool.add(item("a", 1)).unwrap();
        assert!(matches!(
            pool.add(item("a", 2)),
            Err(RenderError::DuplicateId(_))
        ));
        assert_eq!(pool.find("a").unwrap().value, 1);
    }

    #[test]
    fn delete_swaps_last_into_hole() {
        let mut pool = Pool::new("items", 4);
        for id in ["a", "b", "c", "d"] {
            pool.add(item(id, 0)).unwrap();
        }

        let removed = pool.delete("b").unwrap();
        assert_eq!(removed.id, "b");
        assert_eq!(pool.len(), 3);
        assert_eq!(ids(&pool), ["a", "d", "c"]);
        assert_eq!(pool.index_of("d"), Some(1));
        assert!(pool.find("b").is_none());
    }

    #[test]
    fn delete_last_and_missing() {
        let mut pool = Pool::new("items", 2);
        pool.add(item("a", 0)).unwrap();
        pool.add(item("b", 0)).unwrap();

        assert!(pool.delete("missing").is_none());
        assert_eq!(pool.len(), 2);

        pool.delete("b");
        assert_eq!(ids(&pool), ["a"]);
    }

    #[test]
    fn handles_survive_swap_remove() {
        let mut pool = Pool::new("items", 4);
        let a = pool.add(item("a", 1)).unwrap();
        let b = pool.add(item("b", 2)).unwrap();
        let c = pool.add(item("c", 3)).unwrap();

        pool.delete("a");
        assert!(pool.get(a).is_none());
        assert_eq!(pool.get(b).unwrap().value, 2);
        assert_eq!(pool.get(c).unwrap().value, 3);

        pool.get_mut(c).unwrap().value = 30;
        assert_eq!(pool.find("c").unwrap().value, 30);
    }

    #[test]
    fn stale_handle_does_not_resolve_after_slot_reuse() {
        let mut pool = Pool::new("items", 2);
        let a = pool.add(item("a", 1)).unwrap();
        pool.delete("a");
        let b = pool.add(item("b", 2)).unwrap();

        assert_ne!(a, b);
        assert!(pool.get(a).is_none());
        assert_eq!(pool.get(b).unwrap().id, "b");
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn handle_of_matches_add() {
        let mut pool = Pool::new("items", 3);
        pool.add(item("a", 1)).unwrap();
        let b = pool.add(item("b", 2)).unwrap();
        pool.delete("a");
        assert_eq!(pool.handle_of("b"), Some(b));

        let pairs: Vec<_> = pool.iter_with_handles().map(|(h, i)| (h, i.value)).collect();
        assert_eq!(pairs, vec![(b, 2)]);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut pool = Pool::new("items", 3);
        let a = pool.add(item("a", 1)).unwrap();
        pool.add(item("b", 2)).unwrap();
        pool.clear();
        assert!(pool.is_empty());
        assert!(!pool.contains(a));
        pool.add(item("a", 3)).unwrap();
        assert_eq!(pool.len(), 1);
    }
}
