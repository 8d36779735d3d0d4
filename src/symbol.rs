//! Identifier types for individuals, classes and properties.
//!
//! Individuals get a niche-optimised [`EntityId`] handed out by an
//! [`IdAllocator`]. Classes and properties are dense indices into the merged
//! TBox. Names coming from scenarios may be qualified (`DUL.hasLocation`);
//! [`local_name`] strips the prefix so every lookup happens on the local part.

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Unique, niche-optimized identifier for an individual in the store.
///
/// Uses `NonZeroU64` so that `Option<EntityId>` is the same size as `EntityId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(NonZeroU64);

impl EntityId {
    /// Create an `EntityId` from a raw `u64`.
    ///
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EntityId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ind:{}", self.0)
    }
}

/// Index of a class in the merged TBox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub(crate) usize);

impl ClassId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a property in the merged TBox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(pub(crate) usize);

impl PropertyId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Individual ID allocator.
///
/// Produces monotonically increasing IDs starting from 1. IDs of destroyed
/// individuals are never reused within one store.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create a new allocator that starts from ID 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next entity ID.
    pub fn next_id(&mut self) -> EntityId {
        let raw = self.next;
        self.next = self.next.saturating_add(1);
        // `next` starts at 1 and saturates, so it never yields zero.
        EntityId(NonZeroU64::MIN.saturating_add(raw - 1))
    }

    /// Return the next ID that *would* be allocated, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a namespace prefix: `DUL.hasLocation` → `hasLocation`.
pub fn local_name(qualified: &str) -> &str {
    let trimmed = qualified.trim();
    trimmed.rsplit('.').next().unwrap_or(trimmed)
}
