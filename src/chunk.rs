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

//! Chunk pages, the chunk pool, and column layout derivation.
//!
//! A chunk is a fixed 16 KiB page holding up to `capacity` entities as
//! parallel columns (SoA). Chunks are boxed so they never relocate once
//! handed out.

use rustc_hash::FxHashMap;

use crate::entity::Entity;

/// Size of one chunk page in bytes.
pub const CHUNK_BYTES: usize = 16 * 1024;

#[repr(C, align(64))]
pub(crate) struct Chunk {
    data: [u8; CHUNK_BYTES],
}

impl Chunk {
    fn zeroed() -> Box<Chunk> {
        Box::new(Chunk {
            data: [0; CHUNK_BYTES],
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

/// Free-list pool of chunk pages.
///
/// Ownership lends to a combination and returns here when the chunk empties.
pub(crate) struct ChunkPool {
    free: Vec<Box<Chunk>>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn acquire(&mut self) -> Box<Chunk> {
        self.free.pop().unwrap_or_else(Chunk::zeroed)
    }

    pub fn release(&mut self, chunk: Box<Chunk>) {
        self.free.push(chunk);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Column layout of a chunk, derived from the archetype's component ids,
/// sizes and alignments.
///
/// Columns are packed in descending alignment order; the entity column
/// participates with `align_of::<Entity>()`. Each column occupies
/// `size * capacity` bytes, so offsets stay aligned as long as the chunk base
/// is max-aligned.
#[derive(Debug)]
pub(crate) struct ChunkLayout {
    capacity: usize,
    entity_offset: usize,
    component_ids: Vec<u32>,
    component_sizes: Vec<usize>,
    component_offsets: Vec<usize>,
    component_index: FxHashMap<u32, usize>,
}

impl ChunkLayout {
    pub fn new(component_ids: &[u32], sizes: &[usize], aligns: &[usize]) -> Self {
        debug_assert_eq!(component_ids.len(), sizes.len());
        debug_assert_eq!(component_ids.len(), aligns.len());

        let total: usize = sizes.iter().sum::<usize>() + std::mem::size_of::<Entity>();
        let capacity = CHUNK_BYTES / total;
        if capacity == 0 {
            panic!("component set too large for one chunk ({total} bytes per entity)");
        }

        // Entity column carries the sentinel index -1.
        let mut align_and_indices: Vec<(usize, isize)> = aligns
            .iter()
            .enumerate()
            .map(|(index, &align)| (align, index as isize))
            .collect();
        align_and_indices.push((std::mem::align_of::<Entity>(), -1));
        align_and_indices.sort_unstable_by(|a, b| b.cmp(a));

        let mut component_index = FxHashMap::default();
        component_index.reserve(component_ids.len());
        let mut component_offsets = vec![0usize; component_ids.len()];
        let mut entity_offset = 0usize;
        let mut offset = 0usize;
        for (align, index) in align_and_indices {
            debug_assert!(offset % align == 0);
            if index == -1 {
                entity_offset = offset;
                offset += std::mem::size_of::<Entity>() * capacity;
            } else {
                let index = index as usize;
                component_index.insert(component_ids[index], index);
                component_offsets[index] = offset;
                offset += sizes[index] * capacity;
            }
        }
        debug_assert!(offset <= CHUNK_BYTES);

        Self {
            capacity,
            entity_offset,
            component_ids: component_ids.to_vec(),
            component_sizes: sizes.to_vec(),
            component_offsets,
            component_index,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entity_offset(&self) -> usize {
        self.entity_offset
    }

    /// Column index for a component id, if the id is part of this layout.
    pub fn column_of(&self, component_id: u32) -> Option<usize> {
        self.component_index.get(&component_id).copied()
    }

    pub fn column_offset(&self, column: usize) -> usize {
        self.component_offsets[column]
    }

    pub fn column_size(&self, column: usize) -> usize {
        self.component_sizes[column]
    }

    pub fn column_component_id(&self, column: usize) -> u32 {
        self.component_ids[column]
    }

    pub fn column_count(&self) -> usize {
        self.component_sizes.len()
    }
}
