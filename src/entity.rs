// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity identifiers, locations and the versioned id allocator.

use std::collections::VecDeque;

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Number of ids handed to a command buffer per allocator round-trip.
pub(crate) const ID_LEASE_SIZE: usize = 16;

/// Versioned entity identifier.
///
/// `id` indexes the dense entity-location table; `version` disambiguates
/// reuses of the same id so a stale handle never resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    pub id: u32,
    pub version: u32,
}

impl Entity {
    /// Sentinel handle that never refers to a live entity.
    pub const INVALID: Entity = Entity {
        id: u32::MAX,
        version: 0,
    };

    /// Whether this handle is the invalid sentinel.
    pub fn valid(&self) -> bool {
        self.id != u32::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::INVALID
    }
}

/// Where an entity currently lives: `(archetype, combination, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype_id: u32,
    pub combination_index: u32,
    pub index_in_combination: u32,
}

impl EntityLocation {
    pub const INVALID: EntityLocation = EntityLocation {
        archetype_id: u32::MAX,
        combination_index: u32::MAX,
        index_in_combination: u32::MAX,
    };

    pub fn valid(&self) -> bool {
        self.archetype_id != u32::MAX
    }
}

impl Default for EntityLocation {
    fn default() -> Self {
        EntityLocation::INVALID
    }
}

struct AllocatorState {
    next_id: u32,
    versions: Vec<u32>,
    free: VecDeque<u32>,
    /// Ids freed during the current tick; not reusable until the tick ends.
    quarantined: Vec<u32>,
}

/// Lock-guarded entity id allocator.
///
/// Immediate creation assigns single ids; command buffers lease batches so the
/// mutex is only taken on the refill path during parallel recording.
pub(crate) struct EntityIdAllocator {
    state: Mutex<AllocatorState>,
}

impl EntityIdAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next_id: 0,
                versions: Vec::new(),
                free: VecDeque::new(),
                quarantined: Vec::new(),
            }),
        }
    }

    pub fn assign(&self) -> Entity {
        let mut state = self.state.lock();
        Self::assign_locked(&mut state)
    }

    fn assign_locked(state: &mut AllocatorState) -> Entity {
        if let Some(id) = state.free.pop_front() {
            return Entity {
                id,
                version: state.versions[id as usize],
            };
        }
        let id = state.next_id;
        if id == u32::MAX {
            panic!("entity id space exhausted (max {})", u32::MAX - 1);
        }
        state.next_id += 1;
        state.versions.push(0);
        Entity { id, version: 0 }
    }

    /// Reserve a batch of ids for a command buffer.
    pub fn lease(&self, count: usize) -> IdLease {
        let mut state = self.state.lock();
        let mut ids = SmallVec::with_capacity(count);
        for _ in 0..count {
            ids.push(Self::assign_locked(&mut state));
        }
        IdLease { ids, cursor: 0 }
    }

    /// Return ids a drained buffer reserved but never handed out.
    ///
    /// The ids were never observable outside the buffer, so their versions are
    /// left untouched.
    pub fn restore(&self, lease: &mut IdLease) {
        let mut state = self.state.lock();
        for entity in lease.ids.drain(lease.cursor..) {
            state.free.push_back(entity.id);
        }
        lease.cursor = 0;
        lease.ids.clear();
    }

    /// Retire an id. The version is bumped immediately so stale handles stop
    /// resolving, but the id is quarantined until the tick ends.
    pub fn recycle(&self, id: u32) {
        let mut state = self.state.lock();
        state.versions[id as usize] = state.versions[id as usize].wrapping_add(1);
        state.quarantined.push(id);
    }

    /// Move ids freed during this tick onto the free list.
    pub fn promote_quarantined(&self) {
        let mut state = self.state.lock();
        while let Some(id) = state.quarantined.pop() {
            state.free.push_back(id);
        }
    }

    /// Whether the handle's version matches the allocator's current version
    /// for its id. Location validity is checked separately by the manager.
    pub fn handle_current(&self, entity: Entity) -> bool {
        if !entity.valid() {
            return false;
        }
        let state = self.state.lock();
        (entity.id as usize) < state.versions.len()
            && state.versions[entity.id as usize] == entity.version
    }
}

/// A batch of pre-reserved entity ids owned by one command buffer.
pub(crate) struct IdLease {
    ids: SmallVec<[Entity; ID_LEASE_SIZE]>,
    cursor: usize,
}

impl IdLease {
    pub fn empty() -> Self {
        Self {
            ids: SmallVec::new(),
            cursor: 0,
        }
    }

    pub fn pop(&mut self) -> Option<Entity> {
        let entity = self.ids.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(entity)
    }

    pub fn exhausted(&self) -> bool {
        self.cursor >= self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_is_dense() {
        let allocator = EntityIdAllocator::new();
        let a = allocator.assign();
        let b = allocator.assign();
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(a.version, 0);
    }

    #[test]
    fn test_recycle_bumps_version_and_quarantines() {
        let allocator = EntityIdAllocator::new();
        let a = allocator.assign();
        allocator.recycle(a.id);
        assert!(!allocator.handle_current(a));

        // Still quarantined: a fresh assign must not reuse the id.
        let b = allocator.assign();
        assert_ne!(b.id, a.id);

        allocator.promote_quarantined();
        let c = allocator.assign();
        assert_eq!(c.id, a.id);
        assert_eq!(c.version, a.version + 1);
    }

    #[test]
    fn test_lease_restore_returns_unused_ids() {
        let allocator = EntityIdAllocator::new();
        let mut lease = allocator.lease(4);
        let first = lease.pop().unwrap();
        allocator.restore(&mut lease);

        // The three unused ids come back before any new ones.
        let next = allocator.assign();
        assert_ne!(next.id, first.id);
        assert!(next.id < 4);
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!Entity::INVALID.valid());
        assert!(!EntityLocation::INVALID.valid());
    }
}
