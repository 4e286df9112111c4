//! Fixed-capacity record pool with generation-checked handles
//!
//! Operation and transaction records are seized from a pool of fixed size and
//! returned when the protocol releases them. Every slot carries a generation
//! counter that is bumped on release, so a handle kept past the release of its
//! record is detected as stale instead of aliasing whatever record reuses the
//! slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bits of the wire word used for the slot index
const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Bits of the wire word used for the generation tag
const GENERATION_BITS: u32 = 8;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Largest pool that can be addressed through a wire word
pub const MAX_ARENA_CAPACITY: usize = 1 << INDEX_BITS;

/// Arena errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("Pool exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },

    #[error("Stale or unknown handle {0}")]
    StaleHandle(Handle),

    #[error("Stale or unknown record word H'{0:08x}")]
    StaleWord(u32),
}

/// Handle to a seized record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// 28-bit wire form: generation tag above the slot index.
    ///
    /// The top four bits stay clear so the word can share its first word with
    /// a packed-signal tag.
    pub fn to_word(&self) -> u32 {
        ((self.generation & GENERATION_MASK) << INDEX_BITS) | (self.index & INDEX_MASK)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation, .. } => *generation,
        }
    }
}

/// Fixed-capacity pool of records
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Vacant slot indexes, most recently released last
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty pool. Capacity is clamped to what a wire word can address.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_ARENA_CAPACITY);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seize a slot for `value`
    pub fn seize(&mut self, value: T) -> Result<Handle, ArenaError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation();
            *slot = Slot::Occupied { generation, value };
            self.len += 1;
            return Ok(Handle { index, generation });
        }

        if self.slots.len() >= self.capacity {
            return Err(ArenaError::Exhausted {
                capacity: self.capacity,
            });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(Handle {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, handle: Handle) -> Result<&T, ArenaError> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Ok(value)
            }
            _ => Err(ArenaError::StaleHandle(handle)),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, ArenaError> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Ok(value)
            }
            _ => Err(ArenaError::StaleHandle(handle)),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Resolve a wire word back to a live handle
    pub fn resolve_word(&self, word: u32) -> Result<Handle, ArenaError> {
        let index = word & INDEX_MASK;
        let tag = (word >> INDEX_BITS) & GENERATION_MASK;
        match self.slots.get(index as usize) {
            Some(Slot::Occupied { generation, .. }) if generation & GENERATION_MASK == tag => {
                Ok(Handle {
                    index,
                    generation: *generation,
                })
            }
            _ => Err(ArenaError::StaleWord(word)),
        }
    }

    /// Return a record to the pool; the slot's generation moves on
    pub fn release(&mut self, handle: Handle) -> Result<T, ArenaError> {
        self.get(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        let next_generation = slot.generation().wrapping_add(1);
        let previous = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: next_generation,
            },
        );
        self.free.push(handle.index);
        self.len -= 1;
        match previous {
            Slot::Occupied { value, .. } => Ok(value),
            Slot::Vacant { .. } => Err(ArenaError::StaleHandle(handle)),
        }
    }

    /// Iterate over live records
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of all live records, for passes that mutate while walking
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seize_and_release() {
        let mut arena = Arena::with_capacity(2);
        let a = arena.seize("a").unwrap();
        let b = arena.seize("b").unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(*arena.get(a).unwrap(), "a");
        assert_eq!(*arena.get(b).unwrap(), "b");

        assert_eq!(arena.release(a).unwrap(), "a");
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a).is_err());
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut arena = Arena::with_capacity(1);
        arena.seize(1).unwrap();
        assert_eq!(
            arena.seize(2),
            Err(ArenaError::Exhausted { capacity: 1 })
        );
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut arena = Arena::with_capacity(1);
        let first = arena.seize("first").unwrap();
        arena.release(first).unwrap();

        let second = arena.seize("second").unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());

        assert_eq!(arena.get(first), Err(ArenaError::StaleHandle(first)));
        assert_eq!(*arena.get(second).unwrap(), "second");
        assert!(arena.release(first).is_err());
    }

    #[test]
    fn test_released_slots_are_reused_before_growing() {
        let mut arena = Arena::with_capacity(3);
        let a = arena.seize('a').unwrap();
        let b = arena.seize('b').unwrap();
        arena.release(a).unwrap();
        arena.release(b).unwrap();

        // Most recently released first, and never past the slots already made
        let b2 = arena.seize('x').unwrap();
        let a2 = arena.seize('y').unwrap();
        assert_eq!(b2.index(), b.index());
        assert_eq!(a2.index(), a.index());
        assert_eq!(arena.len(), 2);

        let c = arena.seize('z').unwrap();
        assert_eq!(c.index(), 2);
        assert_eq!(arena.seize('w'), Err(ArenaError::Exhausted { capacity: 3 }));

        // Past the 8-bit wire tag, old handles still miss
        let mut current = c;
        for _ in 0..300 {
            let value = arena.release(current).unwrap();
            let again = arena.seize(value).unwrap();
            assert_eq!(again.index(), c.index());
            assert!(arena.get(current).is_err());
            current = again;
        }
        assert_eq!(arena.len(), 3);
        assert_eq!(*arena.get(current).unwrap(), 'z');
    }

    #[test]
    fn test_word_resolution_checks_generation() {
        let mut arena = Arena::with_capacity(4);
        let h = arena.seize(10).unwrap();
        let word = h.to_word();
        assert_eq!(word >> 28, 0);
        assert_eq!(arena.resolve_word(word).unwrap(), h);

        arena.release(h).unwrap();
        assert_eq!(arena.resolve_word(word), Err(ArenaError::StaleWord(word)));

        let reused = arena.seize(11).unwrap();
        assert_ne!(reused.to_word(), word);
        assert!(arena.resolve_word(word).is_err());
    }

    #[test]
    fn test_iter_skips_vacant() {
        let mut arena = Arena::with_capacity(3);
        let a = arena.seize('a').unwrap();
        let _b = arena.seize('b').unwrap();
        arena.release(a).unwrap();
        let values: Vec<char> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['b']);
    }
}
