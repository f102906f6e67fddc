//! Entity handles and allocation.
//!
//! An [`Entity`] is a 64-bit handle packing a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! whenever an index is recycled, so a handle held across a despawn goes
//! stale immediately instead of silently aliasing a new entity.

use std::collections::VecDeque;
use std::fmt;

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(u64);

impl Entity {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation, for logs and external tables.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// Allocates and recycles [`Entity`] handles with generational tracking.
///
/// Free indices sit in a FIFO queue so generations spread across slots
/// instead of concentrating on one hot index.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    /// Current generation for each index slot.
    generations: Vec<u32>,
    /// Whether the slot is currently alive.
    alive: Vec<bool>,
    /// Free-list of recyclable indices.
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh handle, reusing a recycled index when one is
    /// available.
    pub fn allocate(&mut self) -> Entity {
        if let Some(index) = self.free_indices.pop_front() {
            // Generation was already bumped on deallocate.
            self.alive[index as usize] = true;
            Entity::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            Entity::new(index, 0)
        }
    }

    /// Releases an entity's index back to the free list and bumps its
    /// generation, invalidating every outstanding copy of the handle.
    ///
    /// Returns `false` if the handle was stale or already dead.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        let idx = entity.index() as usize;
        if idx >= self.generations.len() {
            return false;
        }
        if self.generations[idx] != entity.generation() {
            return false;
        }
        if !self.alive[idx] {
            return false;
        }
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(entity.index());
        true
    }

    /// Whether `entity` is live and its generation matches the slot.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let idx = entity.index() as usize;
        if idx >= self.generations.len() {
            return false;
        }
        self.alive[idx] && self.generations[idx] == entity.generation()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn handles_stay_unique_across_churn() {
        let mut alloc = EntityAllocator::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut live: Vec<Entity> = Vec::new();

        for round in 0..10 {
            for _ in 0..8 {
                let e = alloc.allocate();
                assert!(seen.insert(e.to_raw()), "handle handed out twice: {e}");
                live.push(e);
            }
            // Release every other survivor to feed the free list.
            let mut i = 0;
            live.retain(|&e| {
                i += 1;
                if i % 2 == round % 2 {
                    assert!(alloc.deallocate(e));
                    false
                } else {
                    true
                }
            });
        }
        assert_eq!(alloc.alive_count(), live.len());
    }

    #[test]
    fn recycled_index_carries_a_newer_generation() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.deallocate(first));

        let second = alloc.allocate();
        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());
        assert!(!alloc.is_alive(first));
        assert!(alloc.is_alive(second));
    }

    #[test]
    fn free_indices_recycle_in_release_order() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        let _c = alloc.allocate();
        alloc.deallocate(b);
        alloc.deallocate(a);

        assert_eq!(alloc.allocate().index(), b.index());
        assert_eq!(alloc.allocate().index(), a.index());
    }

    #[test]
    fn stale_and_malformed_handles_are_rejected() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.deallocate(e));
        assert!(!alloc.deallocate(e), "second release of the same handle");
        assert!(!alloc.deallocate(Entity::new(99, 0)), "index never allocated");
        assert!(!alloc.is_alive(Entity::new(e.index(), 99)));
    }

    #[test]
    fn alive_count_follows_the_churn() {
        let mut alloc = EntityAllocator::new();
        let handles: Vec<Entity> = (0..5).map(|_| alloc.allocate()).collect();
        assert_eq!(alloc.alive_count(), 5);

        for &e in &handles[..3] {
            alloc.deallocate(e);
        }
        assert_eq!(alloc.alive_count(), 2);

        alloc.allocate();
        assert_eq!(alloc.alive_count(), 3);
    }

    #[test]
    fn packing_roundtrips_through_raw() {
        let e = Entity::new(42, 7);
        assert_eq!((e.index(), e.generation()), (42, 7));
        assert_eq!(Entity::from_raw(e.to_raw()), e);
        assert_eq!(format!("{e}"), "42v7");
        assert_eq!(format!("{e:?}"), "Entity(42v7)");
    }
}
