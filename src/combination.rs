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

//! Combinations: the chunks of one exact shared-component tuple.
//!
//! All row mutations are O(1). Removal swaps with the last row, so at most
//! one other entity changes its index; the swapped entity is returned so the
//! caller can patch the global location table.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk::{Chunk, ChunkLayout, ChunkPool};
use crate::entity::Entity;

/// Outcome of a cross-combination entity move.
pub(crate) struct CombinationMove {
    pub dst_index: u32,
    pub dst_chunk_added: bool,
    pub src_swapped: Entity,
    pub src_chunk_removed: bool,
}

pub(crate) struct Combination {
    index: u32,
    shared_component_indices: SmallVec<[u32; 4]>,
    layout: Arc<ChunkLayout>,
    chunks: Vec<Box<Chunk>>,
    entity_count: usize,
}

impl Combination {
    pub fn new(
        index: u32,
        shared_component_indices: SmallVec<[u32; 4]>,
        layout: Arc<ChunkLayout>,
    ) -> Self {
        Self {
            index,
            shared_component_indices,
            layout,
            chunks: Vec::new(),
            entity_count: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn shared_component_indices(&self) -> &[u32] {
        &self.shared_component_indices
    }

    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Append an entity slot. Component columns keep whatever bytes the slot
    /// held before (zeroed for fresh chunks); callers overwrite them.
    pub fn add_entity(&mut self, entity: Entity, pool: &mut ChunkPool) -> (u32, bool) {
        let chunk_added = self.ensure_slot(pool);
        let index = self.entity_count;
        unsafe {
            *self.entity_ptr_mut(index) = entity;
        }
        self.entity_count += 1;
        (index as u32, chunk_added)
    }

    /// Swap-remove the entity at `index`. Returns the entity that moved into
    /// the vacated slot (`Entity::INVALID` if the last slot was removed) and
    /// whether the trailing chunk was released.
    pub fn remove_entity(&mut self, index: u32, pool: &mut ChunkPool) -> (Entity, bool) {
        let index = index as usize;
        debug_assert!(index < self.entity_count);
        let last = self.entity_count - 1;
        let mut swapped = Entity::INVALID;
        if index != last {
            self.copy_row(last, index);
            swapped = self.entity_at(index);
        }
        self.entity_count = last;
        let chunk_removed = self.shrink(pool);
        (swapped, chunk_removed)
    }

    /// Move the entity at `src_index` out of `src` into this combination,
    /// writing `component` into the column that only this layout has.
    pub fn move_entity_adding_component(
        &mut self,
        src: &mut Combination,
        src_index: u32,
        component_id: u32,
        component: *const u8,
        pool: &mut ChunkPool,
    ) -> CombinationMove {
        let dst_chunk_added = self.ensure_slot(pool);
        let dst_index = self.entity_count;
        unsafe {
            *self.entity_ptr_mut(dst_index) = src.entity_at(src_index as usize);
        }
        for column in 0..self.layout.column_count() {
            let id = self.layout.column_component_id(column);
            let size = self.layout.column_size(column);
            let dst_ptr = self.slot_ptr_mut(dst_index, column);
            if id == component_id {
                unsafe {
                    std::ptr::copy_nonoverlapping(component, dst_ptr, size);
                }
            } else {
                let src_column = src
                    .layout
                    .column_of(id)
                    .expect("source combination misses a shared column");
                debug_assert_eq!(size, src.layout.column_size(src_column));
                let src_ptr = src.slot_ptr(src_index as usize, src_column);
                unsafe {
                    std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, size);
                }
            }
        }
        self.entity_count += 1;
        let (src_swapped, src_chunk_removed) = src.remove_entity(src_index, pool);
        CombinationMove {
            dst_index: dst_index as u32,
            dst_chunk_added,
            src_swapped,
            src_chunk_removed,
        }
    }

    /// Move the entity at `src_index` out of `src` into this combination,
    /// copying every column this layout has. Also used when only the shared
    /// tuple changes: the column sets are then identical.
    pub fn move_entity_removing_component(
        &mut self,
        src: &mut Combination,
        src_index: u32,
        pool: &mut ChunkPool,
    ) -> CombinationMove {
        let dst_chunk_added = self.ensure_slot(pool);
        let dst_index = self.entity_count;
        unsafe {
            *self.entity_ptr_mut(dst_index) = src.entity_at(src_index as usize);
        }
        for column in 0..self.layout.column_count() {
            let id = self.layout.column_component_id(column);
            let size = self.layout.column_size(column);
            let src_column = src
                .layout
                .column_of(id)
                .expect("source combination misses a shared column");
            debug_assert_eq!(size, src.layout.column_size(src_column));
            let src_ptr = src.slot_ptr(src_index as usize, src_column);
            let dst_ptr = self.slot_ptr_mut(dst_index, column);
            unsafe {
                std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, size);
            }
        }
        self.entity_count += 1;
        let (src_swapped, src_chunk_removed) = src.remove_entity(src_index, pool);
        CombinationMove {
            dst_index: dst_index as u32,
            dst_chunk_added,
            src_swapped,
            src_chunk_removed,
        }
    }

    /// Copy `component` into its column slot.
    pub fn set_component(&mut self, index: u32, component_id: u32, component: *const u8) {
        let column = self
            .layout
            .column_of(component_id)
            .expect("component id not in this combination's layout");
        let size = self.layout.column_size(column);
        let dst = self.slot_ptr_mut(index as usize, column);
        unsafe {
            std::ptr::copy_nonoverlapping(component, dst, size);
        }
    }

    /// Read a component slot as raw bytes.
    pub fn component_ptr(&self, index: u32, component_id: u32) -> Option<*const u8> {
        let column = self.layout.column_of(component_id)?;
        Some(self.slot_ptr(index as usize, column))
    }

    pub fn entity_at(&self, index: usize) -> Entity {
        debug_assert!(index < self.entity_count);
        unsafe { *(self.entity_ptr(index)) }
    }

    /// Base pointer and entity count of each chunk, front to back.
    pub fn chunk_spans(&self) -> impl Iterator<Item = (*const u8, usize)> + '_ {
        let capacity = self.layout.capacity();
        self.chunks.iter().enumerate().map(move |(i, chunk)| {
            let filled = (self.entity_count - i * capacity).min(capacity);
            (chunk.as_ptr(), filled)
        })
    }

    fn ensure_slot(&mut self, pool: &mut ChunkPool) -> bool {
        if self.entity_count == self.chunks.len() * self.layout.capacity() {
            self.chunks.push(pool.acquire());
            true
        } else {
            false
        }
    }

    fn shrink(&mut self, pool: &mut ChunkPool) -> bool {
        let capacity = self.layout.capacity();
        let needed = self.entity_count.div_ceil(capacity);
        if self.chunks.len() > needed {
            pool.release(self.chunks.pop().expect("chunk count out of sync"));
            true
        } else {
            false
        }
    }

    fn copy_row(&mut self, from: usize, to: usize) {
        debug_assert_ne!(from, to);
        for column in 0..self.layout.column_count() {
            let size = self.layout.column_size(column);
            let src = self.slot_ptr_mut(from, column) as *const u8;
            let dst = self.slot_ptr_mut(to, column);
            unsafe {
                std::ptr::copy_nonoverlapping(src, dst, size);
            }
        }
        let entity = unsafe { *(self.entity_ptr_mut(from) as *const Entity) };
        unsafe {
            *self.entity_ptr_mut(to) = entity;
        }
    }

    fn slot_ptr(&self, index: usize, column: usize) -> *const u8 {
        let capacity = self.layout.capacity();
        let size = self.layout.column_size(column);
        let offset = self.layout.column_offset(column) + (index % capacity) * size;
        unsafe { self.chunks[index / capacity].as_ptr().add(offset) }
    }

    fn slot_ptr_mut(&mut self, index: usize, column: usize) -> *mut u8 {
        let capacity = self.layout.capacity();
        let size = self.layout.column_size(column);
        let offset = self.layout.column_offset(column) + (index % capacity) * size;
        unsafe { self.chunks[index / capacity].as_mut_ptr().add(offset) }
    }

    fn entity_ptr(&self, index: usize) -> *const Entity {
        let capacity = self.layout.capacity();
        let offset =
            self.layout.entity_offset() + (index % capacity) * std::mem::size_of::<Entity>();
        unsafe { self.chunks[index / capacity].as_ptr().add(offset) as *const Entity }
    }

    fn entity_ptr_mut(&mut self, index: usize) -> *mut Entity {
        let capacity = self.layout.capacity();
        let offset =
            self.layout.entity_offset() + (index % capacity) * std::mem::size_of::<Entity>();
        unsafe { self.chunks[index / capacity].as_mut_ptr().add(offset) as *mut Entity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn entity(id: u32) -> Entity {
        Entity { id, version: 0 }
    }

    fn u32_layout() -> Arc<ChunkLayout> {
        Arc::new(ChunkLayout::new(&[0], &[4], &[4]))
    }

    fn write_value(combination: &mut Combination, index: u32, value: u32) {
        combination.set_component(index, 0, &value as *const u32 as *const u8);
    }

    fn read_value(combination: &Combination, index: u32) -> u32 {
        let ptr = combination.component_ptr(index, 0).unwrap();
        unsafe { *(ptr as *const u32) }
    }

    #[test]
    fn test_add_then_remove_swaps_last() {
        let mut pool = ChunkPool::new();
        let mut combination = Combination::new(0, smallvec![], u32_layout());

        for i in 0..3 {
            let (index, _) = combination.add_entity(entity(i), &mut pool);
            write_value(&mut combination, index, i * 10);
        }

        let (swapped, chunk_removed) = combination.remove_entity(0, &mut pool);
        assert_eq!(swapped, entity(2));
        assert!(!chunk_removed);
        assert_eq!(combination.entity_count(), 2);
        assert_eq!(read_value(&combination, 0), 20);
        assert_eq!(combination.entity_at(0), entity(2));
    }

    #[test]
    fn test_remove_last_returns_invalid() {
        let mut pool = ChunkPool::new();
        let mut combination = Combination::new(0, smallvec![], u32_layout());
        combination.add_entity(entity(0), &mut pool);
        combination.add_entity(entity(1), &mut pool);

        let (swapped, _) = combination.remove_entity(1, &mut pool);
        assert!(!swapped.valid());
    }

    #[test]
    fn test_chunk_allocated_at_capacity_released_when_empty() {
        let mut pool = ChunkPool::new();
        let layout = u32_layout();
        let capacity = layout.capacity();
        let mut combination = Combination::new(0, smallvec![], layout);

        for i in 0..capacity as u32 {
            combination.add_entity(entity(i), &mut pool);
        }
        assert_eq!(combination.chunk_count(), 1);

        let (_, chunk_added) = combination.add_entity(entity(capacity as u32), &mut pool);
        assert!(chunk_added);
        assert_eq!(combination.chunk_count(), 2);

        // The overflow entity is alone in chunk 1; removing an entity from
        // chunk 0 pulls it back and releases chunk 1.
        let (swapped, chunk_removed) = combination.remove_entity(0, &mut pool);
        assert_eq!(swapped, entity(capacity as u32));
        assert!(chunk_removed);
        assert_eq!(combination.chunk_count(), 1);
    }

    #[test]
    fn test_move_adding_component() {
        let mut pool = ChunkPool::new();
        let src_layout = u32_layout();
        let dst_layout = Arc::new(ChunkLayout::new(&[0, 1], &[4, 8], &[4, 8]));
        let mut src = Combination::new(0, smallvec![], src_layout);
        let mut dst = Combination::new(0, smallvec![], dst_layout);

        let (index, _) = src.add_entity(entity(5), &mut pool);
        write_value(&mut src, index, 77);

        let added: u64 = 123;
        let result = dst.move_entity_adding_component(
            &mut src,
            index,
            1,
            &added as *const u64 as *const u8,
            &mut pool,
        );
        assert_eq!(result.dst_index, 0);
        assert!(result.dst_chunk_added);
        assert!(!result.src_swapped.valid());
        assert!(result.src_chunk_removed);

        assert_eq!(src.entity_count(), 0);
        assert_eq!(dst.entity_count(), 1);
        assert_eq!(read_value(&dst, 0), 77);
        let ptr = dst.component_ptr(0, 1).unwrap();
        assert_eq!(unsafe { *(ptr as *const u64) }, 123);
        assert_eq!(dst.entity_at(0), entity(5));
    }

    #[test]
    fn test_move_removing_component() {
        let mut pool = ChunkPool::new();
        let src_layout = Arc::new(ChunkLayout::new(&[0, 1], &[4, 8], &[4, 8]));
        let dst_layout = u32_layout();
        let mut src = Combination::new(0, smallvec![], src_layout);
        let mut dst = Combination::new(0, smallvec![], dst_layout);

        let (index, _) = src.add_entity(entity(9), &mut pool);
        write_value(&mut src, index, 41);

        let result = dst.move_entity_removing_component(&mut src, index, &mut pool);
        assert_eq!(result.dst_index, 0);
        assert_eq!(dst.entity_count(), 1);
        assert_eq!(read_value(&dst, 0), 41);
        assert_eq!(dst.entity_at(0), entity(9));
    }
}
