//! Typed arena storage for trace-side data.
//!
//! Snapshot and frame-info chains are append-only and immutable once
//! recorded, so they live in simple push-only arenas addressed by typed
//! indices. An `Id<T>` is just a `u32`, which keeps the chain nodes small
//! and makes identity comparison (the basis of snapshot memoization) a
//! single integer compare.

use std::marker::PhantomData;

/// A type-safe identifier for arena-allocated items.
///
/// The generic parameter `T` ensures ids from different arenas cannot be
/// mixed up. Traits are implemented manually so `Id<T>` is always
/// Copy/Eq/Hash regardless of `T`.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> Id<T> {
    /// Create an id from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    /// Get the raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Get the index as usize.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Push-only arena of `T` addressed by `Id<T>`.
#[derive(Debug)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    /// Allocate a new item, returning its id.
    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    /// Get a reference to an item.
    #[inline]
    pub fn get(&self, id: Id<T>) -> &T {
        &self.items[id.as_usize()]
    }

    /// Get a mutable reference to an item.
    #[inline]
    pub fn get_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.as_usize()]
    }

    /// Number of items allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the arena is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut arena: Arena<&str> = Arena::new();
        let a = arena.alloc("a");
        let b = arena.alloc("b");
        assert_eq!(arena[a], "a");
        assert_eq!(arena[b], "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_id_identity() {
        let a: Id<i32> = Id::new(3);
        let b: Id<i32> = Id::new(3);
        let c: Id<i32> = Id::new(4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
