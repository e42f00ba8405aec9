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

//! Value stores backing shared and singleton components.
//!
//! Shared components are interned: equal values (per `Eq`/`Hash`) share one
//! refcounted slot, and entities carry only the slot index. A slot index is
//! live iff its refcount is nonzero.

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::{EcsError, Result};
use crate::registry::SharedComponent;

/// Object-safe surface of a shared-component value: identity comparison and
/// hashing across a type-erased boundary.
pub(crate) trait SharedObject: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn SharedObject) -> bool;
    fn hash_dyn(&self) -> u64;
}

impl<T: SharedComponent> SharedObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn SharedObject) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn hash_dyn(&self) -> u64 {
        // DefaultHasher with fixed keys: the digest doubles as a lookup key,
        // so it must be stable for the store's lifetime.
        let mut hasher = DefaultHasher::new();
        TypeId::of::<T>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish()
    }
}

struct SharedSlot {
    shared_component_id: u32,
    hash: u64,
    refcount: u32,
    object: Box<dyn SharedObject>,
}

/// Refcounted interning store for shared-component values.
pub(crate) struct SharedComponentStore {
    slots: Vec<Option<SharedSlot>>,
    free: Vec<u32>,
    /// `(shared id, value hash)` to candidate slots; candidates are resolved
    /// by full equality to tolerate hash collisions.
    lookup: AHashMap<(u32, u64), SmallVec<[u32; 2]>>,
}

impl SharedComponentStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lookup: AHashMap::new(),
        }
    }

    pub fn push<T: SharedComponent>(&mut self, shared_component_id: u32, value: T) -> u32 {
        self.push_boxed(shared_component_id, Box::new(value))
    }

    /// Intern a value: bump the refcount of an equal live value, or claim a
    /// free slot.
    pub fn push_boxed(&mut self, shared_component_id: u32, object: Box<dyn SharedObject>) -> u32 {
        let hash = object.hash_dyn();
        if let Some(candidates) = self.lookup.get(&(shared_component_id, hash)) {
            for &index in candidates {
                let slot = self.slots[index as usize]
                    .as_mut()
                    .expect("lookup points at a freed slot");
                if slot.shared_component_id == shared_component_id && slot.object.eq_dyn(&*object) {
                    slot.refcount += 1;
                    return index;
                }
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[index as usize] = Some(SharedSlot {
            shared_component_id,
            hash,
            refcount: 1,
            object,
        });
        self.lookup
            .entry((shared_component_id, hash))
            .or_default()
            .push(index);
        index
    }

    /// Drop one reference; frees the slot when the count reaches zero.
    pub fn pop(&mut self, shared_component_id: u32, index: u32) {
        let slot = self.slots[index as usize]
            .as_mut()
            .expect("pop on a freed shared-component slot");
        debug_assert_eq!(slot.shared_component_id, shared_component_id);
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }
        let hash = slot.hash;
        self.slots[index as usize] = None;
        self.free.push(index);
        if let Some(candidates) = self.lookup.get_mut(&(shared_component_id, hash)) {
            candidates.retain(|candidate| *candidate != index);
            if candidates.is_empty() {
                self.lookup.remove(&(shared_component_id, hash));
            }
        }
    }

    /// Index of an equal live value, without touching refcounts.
    pub fn object_index(&self, shared_component_id: u32, object: &dyn SharedObject) -> Option<u32> {
        let hash = object.hash_dyn();
        let candidates = self.lookup.get(&(shared_component_id, hash))?;
        candidates
            .iter()
            .copied()
            .find(|&index| {
                let slot = self.slots[index as usize].as_ref();
                slot.map_or(false, |slot| {
                    slot.shared_component_id == shared_component_id && slot.object.eq_dyn(object)
                })
            })
    }

    pub fn get<T: SharedComponent>(&self, index: u32) -> Option<&T> {
        self.slots
            .get(index as usize)?
            .as_ref()?
            .object
            .as_any()
            .downcast_ref::<T>()
    }

    pub fn refcount(&self, index: u32) -> u32 {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
            .map_or(0, |slot| slot.refcount)
    }
}

/// Single-slot storage of singleton values, indexed by singleton id.
pub(crate) struct SingletonComponentStore {
    slots: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl SingletonComponentStore {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn push(&mut self, id: u32, object: Box<dyn Any + Send + Sync>) -> Result<()> {
        let slot = self.slot_mut(id);
        if slot.is_some() {
            return Err(EcsError::SingletonAlreadyPresent);
        }
        *slot = Some(object);
        Ok(())
    }

    pub fn pop(&mut self, id: u32) -> Result<()> {
        match self.slot_mut(id).take() {
            Some(_) => Ok(()),
            None => Err(EcsError::MissingSingleton),
        }
    }

    pub fn set(&mut self, id: u32, object: Box<dyn Any + Send + Sync>) -> Result<()> {
        let slot = self.slot_mut(id);
        if slot.is_none() {
            return Err(EcsError::MissingSingleton);
        }
        *slot = Some(object);
        Ok(())
    }

    pub fn get<T: 'static>(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref()?.downcast_ref::<T>()
    }

    pub fn get_mut<T: 'static>(&mut self, id: u32) -> Option<&mut T> {
        self.slots
            .get_mut(id as usize)?
            .as_mut()?
            .downcast_mut::<T>()
    }

    fn slot_mut(&mut self, id: u32) -> &mut Option<Box<dyn Any + Send + Sync>> {
        let id = id as usize;
        if id >= self.slots.len() {
            self.slots.resize_with(id + 1, || None);
        }
        &mut self.slots[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Eq, Hash, Debug)]
    struct Team(u32);
    impl SharedComponent for Team {}

    #[test]
    fn test_equal_values_share_a_slot() {
        let mut store = SharedComponentStore::new();
        let a = store.push(0, Team(7));
        let b = store.push(0, Team(7));
        assert_eq!(a, b);
        assert_eq!(store.refcount(a), 2);
    }

    #[test]
    fn test_distinct_values_get_distinct_slots() {
        let mut store = SharedComponentStore::new();
        let a = store.push(0, Team(1));
        let b = store.push(0, Team(2));
        assert_ne!(a, b);
        assert_eq!(store.get::<Team>(a), Some(&Team(1)));
        assert_eq!(store.get::<Team>(b), Some(&Team(2)));
    }

    #[test]
    fn test_pop_frees_at_zero_and_reuses_slot() {
        let mut store = SharedComponentStore::new();
        let a = store.push(0, Team(1));
        store.push(0, Team(1));
        store.pop(0, a);
        assert_eq!(store.refcount(a), 1);
        store.pop(0, a);
        assert_eq!(store.refcount(a), 0);
        assert!(store.get::<Team>(a).is_none());
        assert_eq!(store.object_index(0, &Team(1)), None);

        let b = store.push(0, Team(9));
        assert_eq!(b, a); // freed slot reused
    }

    #[test]
    fn test_object_index_does_not_bump() {
        let mut store = SharedComponentStore::new();
        let a = store.push(0, Team(4));
        assert_eq!(store.object_index(0, &Team(4)), Some(a));
        assert_eq!(store.refcount(a), 1);
        assert_eq!(store.object_index(0, &Team(5)), None);
    }

    #[test]
    fn test_singleton_lifecycle() {
        let mut store = SingletonComponentStore::new();
        assert!(matches!(store.pop(0), Err(EcsError::MissingSingleton)));
        store.push(0, Box::new(5u32)).unwrap();
        assert!(matches!(
            store.push(0, Box::new(6u32)),
            Err(EcsError::SingletonAlreadyPresent)
        ));
        store.set(0, Box::new(7u32)).unwrap();
        assert_eq!(store.get::<u32>(0), Some(&7));
        *store.get_mut::<u32>(0).unwrap() = 8;
        store.pop(0).unwrap();
        assert!(store.get::<u32>(0).is_none());
    }
}
