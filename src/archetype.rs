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

//! Archetypes: all entities sharing one exact component signature.
//!
//! An archetype owns one combination per distinct shared-component tuple
//! (sparse by index, freed slots reused) and the algorithms that reshape
//! entities between archetypes. Moves always leave the source slot via
//! swap-with-last; the swapped entity is reported so the entity-location
//! table can be patched.

use std::ptr::NonNull;
use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::chunk::{ChunkLayout, ChunkPool};
use crate::combination::Combination;
use crate::entity::{Entity, EntityLocation};
use crate::filter::{ChunkAccessor, EntityFilter};
use crate::mask::ArchetypeMask;

/// Dense archetype handle issued by the entity manager.
pub type ArchetypeId = u32;

pub(crate) type SharedIndexTuple = SmallVec<[u32; 4]>;

pub(crate) struct Archetype {
    id: ArchetypeId,
    mask: ArchetypeMask,
    component_ids: Vec<u32>,
    component_sizes: Vec<usize>,
    component_aligns: Vec<usize>,
    shared_component_ids: Vec<u32>,
    layout: Arc<ChunkLayout>,
    combinations: Vec<Option<Combination>>,
    combination_lookup: AHashMap<SharedIndexTuple, u32>,
    free_combination_indices: Vec<u32>,
    entity_count: usize,
    chunk_count: usize,
}

impl Archetype {
    /// Build an archetype from its component triple. Ids are re-sorted
    /// ascending (sizes and aligns permuted along) so the derived layout does
    /// not depend on builder call order.
    pub fn new(
        id: ArchetypeId,
        mask: ArchetypeMask,
        component_ids: Vec<u32>,
        component_sizes: Vec<usize>,
        component_aligns: Vec<usize>,
        mut shared_component_ids: Vec<u32>,
    ) -> Self {
        let mut order: Vec<usize> = (0..component_ids.len()).collect();
        order.sort_unstable_by_key(|&at| component_ids[at]);
        let component_ids: Vec<u32> = order.iter().map(|&at| component_ids[at]).collect();
        let component_sizes: Vec<usize> = order.iter().map(|&at| component_sizes[at]).collect();
        let component_aligns: Vec<usize> = order.iter().map(|&at| component_aligns[at]).collect();
        shared_component_ids.sort_unstable();

        let layout = Arc::new(ChunkLayout::new(
            &component_ids,
            &component_sizes,
            &component_aligns,
        ));
        Self {
            id,
            mask,
            component_ids,
            component_sizes,
            component_aligns,
            shared_component_ids,
            layout,
            combinations: Vec::new(),
            combination_lookup: AHashMap::new(),
            free_combination_indices: Vec::new(),
            entity_count: 0,
            chunk_count: 0,
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn mask(&self) -> &ArchetypeMask {
        &self.mask
    }

    pub fn component_ids(&self) -> &[u32] {
        &self.component_ids
    }

    pub fn component_sizes(&self) -> &[usize] {
        &self.component_sizes
    }

    pub fn component_aligns(&self) -> &[usize] {
        &self.component_aligns
    }

    pub fn shared_component_ids(&self) -> &[u32] {
        &self.shared_component_ids
    }

    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn single(&self) -> bool {
        self.mask.single()
    }

    pub fn fully_manual(&self) -> bool {
        self.mask.fully_manual()
    }

    /// Append a freshly created entity to the combination of the empty shared
    /// tuple. Only valid for archetypes without shared components.
    pub fn add_entity(&mut self, entity: Entity, pool: &mut ChunkPool) -> EntityLocation {
        debug_assert!(self.shared_component_ids.is_empty());
        let combination_index = self.create_combination(SharedIndexTuple::new());
        let combination = self.combination_mut(combination_index);
        let (index, chunk_added) = combination.add_entity(entity, pool);
        if chunk_added {
            self.chunk_count += 1;
        }
        self.entity_count += 1;
        EntityLocation {
            archetype_id: self.id,
            combination_index,
            index_in_combination: index,
        }
    }

    /// Move an entity here from `src`, writing `component` into the column
    /// that only this archetype has. The shared tuple is unchanged.
    pub fn move_entity_adding_component(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_location: EntityLocation,
        component_id: u32,
        component: *const u8,
        pool: &mut ChunkPool,
    ) -> (EntityLocation, Entity) {
        let tuple: SharedIndexTuple = src
            .combination(src_location.combination_index)
            .shared_component_indices()
            .into();
        let dst_combination_index = dst.create_combination(tuple);
        let dst_combination = dst.combination_mut(dst_combination_index);
        let src_combination = src.combination_mut(src_location.combination_index);
        let result = dst_combination.move_entity_adding_component(
            src_combination,
            src_location.index_in_combination,
            component_id,
            component,
            pool,
        );
        Self::settle_move(dst, src, src_location.combination_index, &result);
        (
            EntityLocation {
                archetype_id: dst.id,
                combination_index: dst_combination_index,
                index_in_combination: result.dst_index,
            },
            result.src_swapped,
        )
    }

    /// Move an entity here from `src`, dropping the column that only `src`
    /// has. The shared tuple is unchanged.
    pub fn move_entity_removing_component(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_location: EntityLocation,
        pool: &mut ChunkPool,
    ) -> (EntityLocation, Entity) {
        let tuple: SharedIndexTuple = src
            .combination(src_location.combination_index)
            .shared_component_indices()
            .into();
        Self::move_entity_into_tuple(dst, src, src_location, tuple, pool)
    }

    /// Move an entity here from `src`, which lacks `shared_component_id`; the
    /// new store index is spliced into the tuple at the id's ascending-order
    /// position. Data columns are copied unchanged.
    pub fn move_entity_adding_shared_component(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_location: EntityLocation,
        shared_component_id: u32,
        shared_component_index: u32,
        pool: &mut ChunkPool,
    ) -> (EntityLocation, Entity) {
        let src_tuple = src
            .combination(src_location.combination_index)
            .shared_component_indices();
        let mut tuple = SharedIndexTuple::with_capacity(dst.shared_component_ids.len());
        let mut src_at = 0;
        for &id in &dst.shared_component_ids {
            if id == shared_component_id {
                tuple.push(shared_component_index);
            } else {
                tuple.push(src_tuple[src_at]);
                src_at += 1;
            }
        }
        Self::move_entity_into_tuple(dst, src, src_location, tuple, pool)
    }

    /// Mirror of the above; returns the store index dropped from the tuple so
    /// the caller can release its reference.
    pub fn move_entity_removing_shared_component(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_location: EntityLocation,
        shared_component_id: u32,
        pool: &mut ChunkPool,
    ) -> (u32, EntityLocation, Entity) {
        let src_tuple = src
            .combination(src_location.combination_index)
            .shared_component_indices();
        let mut removed_index = u32::MAX;
        let mut tuple = SharedIndexTuple::with_capacity(dst.shared_component_ids.len());
        for (at, &id) in src.shared_component_ids.iter().enumerate() {
            if id == shared_component_id {
                removed_index = src_tuple[at];
            } else {
                tuple.push(src_tuple[at]);
            }
        }
        debug_assert_ne!(removed_index, u32::MAX);
        let (location, swapped) = Self::move_entity_into_tuple(dst, src, src_location, tuple, pool);
        (removed_index, location, swapped)
    }

    /// Re-home an entity to the combination of a tuple where one shared value
    /// is replaced. Same archetype, possibly a different combination. Returns
    /// the replaced store index.
    pub fn set_shared_component(
        &mut self,
        location: EntityLocation,
        shared_component_id: u32,
        shared_component_index: u32,
        pool: &mut ChunkPool,
    ) -> (u32, EntityLocation, Entity) {
        let at = self
            .shared_component_ids
            .binary_search(&shared_component_id)
            .expect("shared component id not in this archetype");
        let mut tuple: SharedIndexTuple = self
            .combination(location.combination_index)
            .shared_component_indices()
            .into();
        let original_index = tuple[at];
        tuple[at] = shared_component_index;

        let dst_combination_index = self.create_combination(tuple);
        if dst_combination_index == location.combination_index {
            // Same tuple: the value was unchanged, nothing moves.
            return (original_index, location, Entity::INVALID);
        }

        let (dst_combination, src_combination) =
            self.combination_pair_mut(dst_combination_index, location.combination_index);
        let result = dst_combination.move_entity_removing_component(
            src_combination,
            location.index_in_combination,
            pool,
        );
        if result.dst_chunk_added {
            self.chunk_count += 1;
        }
        if result.src_chunk_removed {
            self.chunk_count -= 1;
            self.destroy_combination_if_empty(location.combination_index);
        }
        (
            original_index,
            EntityLocation {
                archetype_id: self.id,
                combination_index: dst_combination_index,
                index_in_combination: result.dst_index,
            },
            result.src_swapped,
        )
    }

    /// Swap-remove an entity. Returns a copy of its combination's shared
    /// tuple (the combination may die with it) and the swapped entity.
    pub fn remove_entity(
        &mut self,
        location: EntityLocation,
        pool: &mut ChunkPool,
    ) -> (SharedIndexTuple, Entity) {
        let combination = self.combination_mut(location.combination_index);
        let tuple: SharedIndexTuple = combination.shared_component_indices().into();
        let (swapped, chunk_removed) =
            combination.remove_entity(location.index_in_combination, pool);
        if chunk_removed {
            self.chunk_count -= 1;
            self.destroy_combination_if_empty(location.combination_index);
        }
        self.entity_count -= 1;
        (tuple, swapped)
    }

    /// Column write; not a structural change.
    pub fn set_component(&mut self, location: EntityLocation, component_id: u32, ptr: *const u8) {
        self.combination_mut(location.combination_index).set_component(
            location.index_in_combination,
            component_id,
            ptr,
        );
    }

    pub fn component_ptr(&self, location: EntityLocation, component_id: u32) -> Option<*const u8> {
        self.combination(location.combination_index)
            .component_ptr(location.index_in_combination, component_id)
    }

    pub fn entity_at(&self, location: EntityLocation) -> Entity {
        self.combination(location.combination_index)
            .entity_at(location.index_in_combination as usize)
    }

    pub fn shared_indices_at(&self, combination_index: u32) -> &[u32] {
        self.combination(combination_index).shared_component_indices()
    }

    /// Emit one accessor per chunk of every combination the filter accepts.
    pub fn filter_entities(&self, filter: &EntityFilter, out: &mut Vec<ChunkAccessor>) {
        let shared_ids: SmallVec<[u32; 4]> = SmallVec::from_slice(&self.shared_component_ids);
        for combination in self.combinations.iter().flatten() {
            if !filter.matches_combination(&self.shared_component_ids, combination.shared_component_indices())
            {
                continue;
            }
            let shared_indices: SmallVec<[u32; 4]> =
                SmallVec::from_slice(combination.shared_component_indices());
            for (base, filled) in combination.chunk_spans() {
                out.push(ChunkAccessor::new(
                    NonNull::new(base as *mut u8).expect("chunk base is never null"),
                    combination.layout().clone(),
                    filled,
                    shared_ids.clone(),
                    shared_indices.clone(),
                    filter.required_components,
                ));
            }
        }
    }

    /// Matched chunk and entity counts for a filter.
    pub fn filtered_counts(&self, filter: &EntityFilter) -> (usize, usize) {
        let mut chunks = 0;
        let mut entities = 0;
        for combination in self.combinations.iter().flatten() {
            if filter.matches_combination(&self.shared_component_ids, combination.shared_component_indices())
            {
                chunks += combination.chunk_count();
                entities += combination.entity_count();
            }
        }
        (chunks, entities)
    }

    /// Move an entity into the combination of an explicit tuple; the column
    /// sets of `dst` must be a subset of `src`'s.
    pub fn move_entity_into_tuple(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_location: EntityLocation,
        tuple: SharedIndexTuple,
        pool: &mut ChunkPool,
    ) -> (EntityLocation, Entity) {
        let dst_combination_index = dst.create_combination(tuple);
        let dst_combination = dst.combination_mut(dst_combination_index);
        let src_combination = src.combination_mut(src_location.combination_index);
        let result = dst_combination.move_entity_removing_component(
            src_combination,
            src_location.index_in_combination,
            pool,
        );
        Self::settle_move(dst, src, src_location.combination_index, &result);
        (
            EntityLocation {
                archetype_id: dst.id,
                combination_index: dst_combination_index,
                index_in_combination: result.dst_index,
            },
            result.src_swapped,
        )
    }

    fn settle_move(
        dst: &mut Archetype,
        src: &mut Archetype,
        src_combination_index: u32,
        result: &crate::combination::CombinationMove,
    ) {
        if result.dst_chunk_added {
            dst.chunk_count += 1;
        }
        if result.src_chunk_removed {
            src.chunk_count -= 1;
            src.destroy_combination_if_empty(src_combination_index);
        }
        dst.entity_count += 1;
        src.entity_count -= 1;
    }

    fn create_combination(&mut self, tuple: SharedIndexTuple) -> u32 {
        debug_assert_eq!(tuple.len(), self.shared_component_ids.len());
        if let Some(&index) = self.combination_lookup.get(&tuple) {
            return index;
        }
        let index = match self.free_combination_indices.pop() {
            Some(index) => index,
            None => {
                self.combinations.push(None);
                (self.combinations.len() - 1) as u32
            }
        };
        self.combination_lookup.insert(tuple.clone(), index);
        self.combinations[index as usize] = Some(Combination::new(index, tuple, self.layout.clone()));
        index
    }

    fn destroy_combination_if_empty(&mut self, index: u32) {
        let empty = self.combination(index).is_empty();
        if !empty {
            return;
        }
        let combination = self.combinations[index as usize]
            .take()
            .expect("combination already destroyed");
        debug_assert_eq!(combination.index(), index);
        let tuple: SharedIndexTuple = combination.shared_component_indices().into();
        self.combination_lookup.remove(&tuple);
        self.free_combination_indices.push(index);
    }

    fn combination(&self, index: u32) -> &Combination {
        self.combinations[index as usize]
            .as_ref()
            .expect("dangling combination index")
    }

    fn combination_mut(&mut self, index: u32) -> &mut Combination {
        self.combinations[index as usize]
            .as_mut()
            .expect("dangling combination index")
    }

    fn combination_pair_mut(&mut self, a: u32, b: u32) -> (&mut Combination, &mut Combination) {
        debug_assert_ne!(a, b);
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (head, tail) = self.combinations.split_at_mut(b);
            (
                head[a].as_mut().expect("dangling combination index"),
                tail[0].as_mut().expect("dangling combination index"),
            )
        } else {
            let (head, tail) = self.combinations.split_at_mut(a);
            (
                tail[0].as_mut().expect("dangling combination index"),
                head[b].as_mut().expect("dangling combination index"),
            )
        }
    }

    #[cfg(test)]
    pub fn live_combination_count(&self) -> usize {
        self.combinations.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: u32) -> Entity {
        Entity { id, version: 0 }
    }

    fn plain_archetype(id: ArchetypeId, component_ids: &[u32]) -> Archetype {
        let mut mask = ArchetypeMask::default();
        for &component_id in component_ids {
            mask.mark_component(component_id, false);
        }
        Archetype::new(
            id,
            mask,
            component_ids.to_vec(),
            vec![4; component_ids.len()],
            vec![4; component_ids.len()],
            Vec::new(),
        )
    }

    #[test]
    fn test_component_ids_sorted_regardless_of_build_order() {
        let archetype = plain_archetype(0, &[9, 2, 5]);
        assert_eq!(archetype.component_ids(), &[2, 5, 9]);
    }

    #[test]
    fn test_add_and_remove_entity() {
        let mut pool = ChunkPool::new();
        let mut archetype = plain_archetype(0, &[0]);
        let location_a = archetype.add_entity(entity(0), &mut pool);
        let location_b = archetype.add_entity(entity(1), &mut pool);
        assert_eq!(archetype.entity_count(), 2);
        assert_eq!(location_a.combination_index, location_b.combination_index);

        let (_, swapped) = archetype.remove_entity(location_a, &mut pool);
        assert_eq!(swapped, entity(1));
        assert_eq!(archetype.entity_count(), 1);

        let (_, swapped) = archetype.remove_entity(location_a, &mut pool);
        assert!(!swapped.valid());
        assert_eq!(archetype.entity_count(), 0);
        assert_eq!(archetype.chunk_count(), 0);
        assert_eq!(archetype.live_combination_count(), 0);
    }

    #[test]
    fn test_move_between_archetypes() {
        let mut pool = ChunkPool::new();
        let mut src = plain_archetype(0, &[0]);
        let mut dst = plain_archetype(1, &[0, 1]);

        let src_location = src.add_entity(entity(3), &mut pool);
        let value: u32 = 11;
        src.set_component(src_location, 0, &value as *const u32 as *const u8);

        let added: u32 = 99;
        let (dst_location, swapped) = Archetype::move_entity_adding_component(
            &mut dst,
            &mut src,
            src_location,
            1,
            &added as *const u32 as *const u8,
            &mut pool,
        );
        assert!(!swapped.valid());
        assert_eq!(src.entity_count(), 0);
        assert_eq!(dst.entity_count(), 1);
        assert_eq!(dst_location.archetype_id, 1);

        let kept = dst.component_ptr(dst_location, 0).unwrap();
        assert_eq!(unsafe { *(kept as *const u32) }, 11);

        let (back_location, _) = Archetype::move_entity_removing_component(
            &mut src,
            &mut dst,
            dst_location,
            &mut pool,
        );
        assert_eq!(src.entity_count(), 1);
        let kept = src.component_ptr(back_location, 0).unwrap();
        assert_eq!(unsafe { *(kept as *const u32) }, 11);
    }
}
