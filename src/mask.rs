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

//! Fixed-width bitsets over component id spaces and the archetype mask.
//!
//! The mask is the structural identity of an archetype: two archetypes with
//! equal masks never coexist.

/// Upper bound of the component id space.
pub const MAX_COMPONENT_ID_COUNT: usize = 256;

/// Upper bound of the shared-component id space.
pub const MAX_SHARED_COMPONENT_ID_COUNT: usize = 128;

macro_rules! fixed_bitset {
    ($name:ident, $words:expr, $bits:expr) => {
        /// Fixed-width bitset; direct bitwise ops, no allocations.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            words: [u64; $words],
        }

        impl $name {
            pub fn set(&mut self, index: u32) {
                debug_assert!((index as usize) < $bits);
                self.words[(index / 64) as usize] |= 1 << (index % 64);
            }

            pub fn clear(&mut self, index: u32) {
                debug_assert!((index as usize) < $bits);
                self.words[(index / 64) as usize] &= !(1 << (index % 64));
            }

            pub fn contains(&self, index: u32) -> bool {
                if (index as usize) >= $bits {
                    return false;
                }
                (self.words[(index / 64) as usize] & (1 << (index % 64))) != 0
            }

            pub fn count_ones(&self) -> u32 {
                self.words.iter().map(|word| word.count_ones()).sum()
            }

            pub fn is_empty(&self) -> bool {
                self.words.iter().all(|&word| word == 0)
            }

            /// Does `self` contain every bit of `other`?
            pub fn contains_all(&self, other: &Self) -> bool {
                self.words
                    .iter()
                    .zip(other.words.iter())
                    .all(|(a, b)| a & b == *b)
            }

            /// Does `self` share any set bit with `other`?
            pub fn intersects(&self, other: &Self) -> bool {
                self.words
                    .iter()
                    .zip(other.words.iter())
                    .any(|(a, b)| a & b != 0)
            }
        }
    };
}

fixed_bitset!(ComponentSet, 4, MAX_COMPONENT_ID_COUNT);
fixed_bitset!(SharedSet, 2, MAX_SHARED_COMPONENT_ID_COUNT);

/// Structural identity of an archetype: which component and shared-component
/// ids it carries, and which of those are manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeMask {
    components: ComponentSet,
    manual_components: ComponentSet,
    shared_components: SharedSet,
    manual_shared_components: SharedSet,
}

impl ArchetypeMask {
    pub fn mark_component(&mut self, id: u32, manual: bool) {
        self.components.set(id);
        if manual {
            self.manual_components.set(id);
        }
    }

    pub fn clear_component(&mut self, id: u32) {
        self.components.clear(id);
        self.manual_components.clear(id);
    }

    pub fn mark_shared_component(&mut self, id: u32, manual: bool) {
        self.shared_components.set(id);
        if manual {
            self.manual_shared_components.set(id);
        }
    }

    pub fn clear_shared_component(&mut self, id: u32) {
        self.shared_components.clear(id);
        self.manual_shared_components.clear(id);
    }

    pub fn contains_component(&self, id: u32) -> bool {
        self.components.contains(id)
    }

    pub fn contains_shared_component(&self, id: u32) -> bool {
        self.shared_components.contains(id)
    }

    pub fn is_manual_component(&self, id: u32) -> bool {
        self.manual_components.contains(id)
    }

    pub fn is_manual_shared_component(&self, id: u32) -> bool {
        self.manual_shared_components.contains(id)
    }

    /// Exactly one component or shared component in total.
    pub fn single(&self) -> bool {
        self.components.count_ones() + self.shared_components.count_ones() == 1
    }

    /// Every present id, in both spaces, is manual.
    pub fn fully_manual(&self) -> bool {
        self.components == self.manual_components
            && self.shared_components == self.manual_shared_components
    }

    /// At least one manual id in either space.
    pub fn any_manual(&self) -> bool {
        !self.manual_components.is_empty() || !self.manual_shared_components.is_empty()
    }

    pub fn component_set(&self) -> &ComponentSet {
        &self.components
    }

    pub fn shared_component_set(&self) -> &SharedSet {
        &self.shared_components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_contains_clear() {
        let mut set = ComponentSet::default();
        set.set(0);
        set.set(63);
        set.set(64);
        set.set(255);
        assert!(set.contains(0));
        assert!(set.contains(63));
        assert!(set.contains(64));
        assert!(set.contains(255));
        assert!(!set.contains(1));
        set.clear(64);
        assert!(!set.contains(64));
        assert_eq!(set.count_ones(), 3);
    }

    #[test]
    fn test_contains_all_and_intersects() {
        let mut a = ComponentSet::default();
        let mut b = ComponentSet::default();
        a.set(3);
        a.set(70);
        b.set(3);
        assert!(a.contains_all(&b));
        assert!(!b.contains_all(&a));
        assert!(a.intersects(&b));
        b.clear(3);
        assert!(!a.intersects(&b));
        assert!(a.contains_all(&b)); // empty subset
    }

    #[test]
    fn test_mask_identity() {
        let mut a = ArchetypeMask::default();
        let mut b = ArchetypeMask::default();
        a.mark_component(2, false);
        a.mark_shared_component(1, false);
        b.mark_shared_component(1, false);
        b.mark_component(2, false);
        assert_eq!(a, b);

        b.mark_component(2, true); // same bit, now manual
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_and_fully_manual() {
        let mut mask = ArchetypeMask::default();
        mask.mark_component(7, true);
        assert!(mask.single());
        assert!(mask.fully_manual());
        assert!(mask.any_manual());

        mask.mark_component(9, false);
        assert!(!mask.single());
        assert!(!mask.fully_manual());

        mask.clear_component(9);
        assert!(mask.single());
        assert!(mask.fully_manual());
    }
}
