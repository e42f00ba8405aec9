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

//! Entity filters and the chunk views they produce.

use std::ptr::NonNull;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk::ChunkLayout;
use crate::entity::Entity;
use crate::mask::{ArchetypeMask, ComponentSet, SharedSet};
use crate::registry::Component;

/// Predicate over archetype masks and shared-component identities.
///
/// An archetype matches iff it carries every required id and none of the
/// rejected ones, in both id spaces. Within a matched archetype, a
/// combination matches iff its shared tuple supplies every required
/// `(id, index)` pair and none of the rejected pairs. The pair lists are kept
/// sorted; tuple checks are sorted merges.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub(crate) required_components: ComponentSet,
    pub(crate) rejected_components: ComponentSet,
    pub(crate) required_shared_components: SharedSet,
    pub(crate) rejected_shared_components: SharedSet,
    pub(crate) required_shared_id_indices: Vec<(u32, u32)>,
    pub(crate) rejected_shared_id_indices: Vec<(u32, u32)>,
}

impl EntityFilter {
    pub(crate) fn matches_archetype(&self, mask: &ArchetypeMask) -> bool {
        mask.component_set().contains_all(&self.required_components)
            && !mask.component_set().intersects(&self.rejected_components)
            && mask
                .shared_component_set()
                .contains_all(&self.required_shared_components)
            && !mask
                .shared_component_set()
                .intersects(&self.rejected_shared_components)
    }

    pub(crate) fn matches_combination(&self, shared_ids: &[u32], shared_indices: &[u32]) -> bool {
        supplies_all(&self.required_shared_id_indices, shared_ids, shared_indices)
            && !supplies_any(&self.rejected_shared_id_indices, shared_ids, shared_indices)
    }
}

/// Every `(id, index)` pair is present in the tuple. Both sides sorted by id.
fn supplies_all(pairs: &[(u32, u32)], shared_ids: &[u32], shared_indices: &[u32]) -> bool {
    let mut at = 0;
    for &(id, index) in pairs {
        while at < shared_ids.len() && shared_ids[at] < id {
            at += 1;
        }
        if at >= shared_ids.len() || shared_ids[at] != id || shared_indices[at] != index {
            return false;
        }
    }
    true
}

/// At least one `(id, index)` pair is present in the tuple.
fn supplies_any(pairs: &[(u32, u32)], shared_ids: &[u32], shared_indices: &[u32]) -> bool {
    let mut at = 0;
    for &(id, index) in pairs {
        while at < shared_ids.len() && shared_ids[at] < id {
            at += 1;
        }
        if at < shared_ids.len() && shared_ids[at] == id && shared_indices[at] == index {
            return true;
        }
    }
    false
}

/// A view of one chunk handed to a task.
///
/// Holds the raw chunk base plus the archetype's layout; valid until the next
/// sync drain, which is guaranteed to happen only after every task borrowing
/// chunks has been joined.
pub struct ChunkAccessor {
    base: NonNull<u8>,
    layout: Arc<ChunkLayout>,
    entity_count: usize,
    shared_component_ids: SmallVec<[u32; 4]>,
    shared_component_indices: SmallVec<[u32; 4]>,
    write_set: ComponentSet,
}

// SAFETY: the accessor only dereferences its chunk pointer between the filter
// call that produced it and the following sync drain; during that window the
// chunk is never moved or structurally mutated, and column aliasing across
// tasks is excluded by the scheduler contract.
unsafe impl Send for ChunkAccessor {}
unsafe impl Sync for ChunkAccessor {}

impl ChunkAccessor {
    pub(crate) fn new(
        base: NonNull<u8>,
        layout: Arc<ChunkLayout>,
        entity_count: usize,
        shared_component_ids: SmallVec<[u32; 4]>,
        shared_component_indices: SmallVec<[u32; 4]>,
        write_set: ComponentSet,
    ) -> Self {
        Self {
            base,
            layout,
            entity_count,
            shared_component_ids,
            shared_component_indices,
            write_set,
        }
    }

    /// Number of entities stored in this chunk.
    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    /// The entity column.
    pub fn entity_array(&self) -> &[Entity] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(self.layout.entity_offset()) as *const Entity,
                self.entity_count,
            )
        }
    }

    /// Read-only column view.
    ///
    /// # Panics
    /// Panics if the component id is not part of this chunk's layout or `T`
    /// does not match the registered size.
    pub fn component_array<T: Component>(&self, component_id: u32) -> &[T] {
        let (ptr, len) = self.column::<T>(component_id);
        unsafe { std::slice::from_raw_parts(ptr as *const T, len) }
    }

    /// Mutable column view.
    ///
    /// # Safety
    /// The caller must guarantee no other live view writes the same
    /// `(component, chunk)` pair; tasks achieve this through filters and the
    /// scheduler's predecessor edges. In debug builds the component must be
    /// in the originating filter's required set.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn component_array_mut<T: Component>(&self, component_id: u32) -> &mut [T] {
        debug_assert!(
            self.write_set.contains(component_id),
            "component {component_id} written without being required by the filter"
        );
        let (ptr, len) = self.column::<T>(component_id);
        std::slice::from_raw_parts_mut(ptr as *mut T, len)
    }

    /// Store index of the chunk's value for a shared component id.
    pub fn shared_component_index(&self, shared_component_id: u32) -> Option<u32> {
        let at = self
            .shared_component_ids
            .iter()
            .position(|&id| id == shared_component_id)?;
        Some(self.shared_component_indices[at])
    }

    fn column<T>(&self, component_id: u32) -> (*mut u8, usize) {
        let column = self
            .layout
            .column_of(component_id)
            .expect("component id not present in this chunk");
        debug_assert_eq!(std::mem::size_of::<T>(), self.layout.column_size(column));
        let ptr = unsafe { self.base.as_ptr().add(self.layout.column_offset(column)) };
        (ptr, self.entity_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archetype_match_requires_and_rejects() {
        let mut filter = EntityFilter::default();
        filter.required_components.set(1);
        filter.rejected_components.set(2);

        let mut with_both = ArchetypeMask::default();
        with_both.mark_component(1, false);
        with_both.mark_component(2, false);
        let mut with_required = ArchetypeMask::default();
        with_required.mark_component(1, false);
        with_required.mark_component(5, false);

        assert!(!filter.matches_archetype(&with_both));
        assert!(filter.matches_archetype(&with_required));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EntityFilter::default();
        let mut mask = ArchetypeMask::default();
        mask.mark_component(0, false);
        mask.mark_shared_component(3, true);
        assert!(filter.matches_archetype(&mask));
        assert!(filter.matches_combination(&[3], &[17]));
    }

    #[test]
    fn test_combination_match_on_pairs() {
        let mut filter = EntityFilter::default();
        filter.required_shared_id_indices = vec![(2, 10), (5, 3)];

        assert!(filter.matches_combination(&[2, 5], &[10, 3]));
        assert!(filter.matches_combination(&[1, 2, 5], &[9, 10, 3]));
        assert!(!filter.matches_combination(&[2, 5], &[10, 4]));
        assert!(!filter.matches_combination(&[2], &[10]));
    }

    #[test]
    fn test_combination_reject_on_pairs() {
        let mut filter = EntityFilter::default();
        filter.rejected_shared_id_indices = vec![(2, 10)];

        assert!(!filter.matches_combination(&[2], &[10]));
        assert!(filter.matches_combination(&[2], &[11]));
        assert!(filter.matches_combination(&[3], &[10]));
    }
}
