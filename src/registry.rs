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

//! Component classification traits and the dense id registry.
//!
//! A type's classification (ordinary, shared, singleton) is which trait it
//! implements; the manual flag is an associated const. Each classification has
//! its own id space with dense, process-stable ids assigned on first use.

use std::any::{type_name, TypeId};
use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::mask::{MAX_COMPONENT_ID_COUNT, MAX_SHARED_COMPONENT_ID_COUNT};

/// Maximum number of distinct singleton component types per world.
pub const MAX_SINGLETON_COMPONENT_ID_COUNT: usize = 256;

/// Per-entity plain data stored inline in chunk columns.
///
/// Components are moved between chunks with raw byte copies, hence `Copy`.
/// Set `MANUAL` to keep an entity alive while this is its only component;
/// removing the last manual component destroys the entity.
pub trait Component: Copy + Send + Sync + 'static {
    const MANUAL: bool = false;
}

/// A value interned per combination; entities carry only a dense store index.
pub trait SharedComponent: Clone + PartialEq + Eq + Hash + Send + Sync + 'static {
    const MANUAL: bool = false;
}

/// A zero-or-one value per world, stored outside the entity tables.
pub trait SingletonComponent: Send + Sync + 'static {}

/// Size, alignment and manual flag captured at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ComponentDescriptor {
    pub id: u32,
    pub size: usize,
    pub align: usize,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdSpace {
    Component,
    Shared,
    Singleton,
}

impl IdSpace {
    fn noun(self) -> &'static str {
        match self {
            IdSpace::Component => "component",
            IdSpace::Shared => "shared component",
            IdSpace::Singleton => "singleton component",
        }
    }
}

/// Maps type descriptors to dense small integers, one space per
/// classification.
pub(crate) struct TypeRegistry {
    spaces: FxHashMap<TypeId, IdSpace>,
    component_ids: FxHashMap<TypeId, u32>,
    shared_ids: FxHashMap<TypeId, u32>,
    singleton_ids: FxHashMap<TypeId, u32>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            spaces: FxHashMap::default(),
            component_ids: FxHashMap::default(),
            shared_ids: FxHashMap::default(),
            singleton_ids: FxHashMap::default(),
        }
    }

    pub fn component_id<T: Component>(&mut self) -> Result<u32> {
        self.register(
            TypeId::of::<T>(),
            type_name::<T>(),
            IdSpace::Component,
            MAX_COMPONENT_ID_COUNT,
        )
    }

    pub fn shared_component_id<T: SharedComponent>(&mut self) -> Result<u32> {
        self.register(
            TypeId::of::<T>(),
            type_name::<T>(),
            IdSpace::Shared,
            MAX_SHARED_COMPONENT_ID_COUNT,
        )
    }

    pub fn singleton_component_id<T: SingletonComponent>(&mut self) -> Result<u32> {
        self.register(
            TypeId::of::<T>(),
            type_name::<T>(),
            IdSpace::Singleton,
            MAX_SINGLETON_COMPONENT_ID_COUNT,
        )
    }

    /// Type-erased registration paths for the command-buffer drain, where
    /// only a `TypeId` travels through the log.
    pub fn component_id_dynamic(&mut self, type_id: TypeId, name: &'static str) -> Result<u32> {
        self.register(type_id, name, IdSpace::Component, MAX_COMPONENT_ID_COUNT)
    }

    pub fn shared_component_id_dynamic(
        &mut self,
        type_id: TypeId,
        name: &'static str,
    ) -> Result<u32> {
        self.register(type_id, name, IdSpace::Shared, MAX_SHARED_COMPONENT_ID_COUNT)
    }

    pub fn singleton_component_id_dynamic(
        &mut self,
        type_id: TypeId,
        name: &'static str,
    ) -> Result<u32> {
        self.register(
            type_id,
            name,
            IdSpace::Singleton,
            MAX_SINGLETON_COMPONENT_ID_COUNT,
        )
    }

    /// Lookup without registration; `None` means the type was never seen.
    pub fn lookup_component_id(&self, type_id: TypeId) -> Option<u32> {
        self.component_ids.get(&type_id).copied()
    }

    pub fn lookup_shared_component_id(&self, type_id: TypeId) -> Option<u32> {
        self.shared_ids.get(&type_id).copied()
    }

    pub fn lookup_singleton_component_id(&self, type_id: TypeId) -> Option<u32> {
        self.singleton_ids.get(&type_id).copied()
    }

    pub fn descriptor<T: Component>(&mut self) -> Result<ComponentDescriptor> {
        Ok(ComponentDescriptor {
            id: self.component_id::<T>()?,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            manual: T::MANUAL,
        })
    }

    fn register(
        &mut self,
        type_id: TypeId,
        name: &str,
        space: IdSpace,
        capacity: usize,
    ) -> Result<u32> {
        match self.spaces.get(&type_id) {
            Some(&registered) if registered != space => {
                return Err(EcsError::TypeContract(format!(
                    "{name} is already registered as a {}, not a {}",
                    registered.noun(),
                    space.noun()
                )));
            }
            Some(_) => {}
            None => {
                self.spaces.insert(type_id, space);
            }
        }

        let ids = match space {
            IdSpace::Component => &mut self.component_ids,
            IdSpace::Shared => &mut self.shared_ids,
            IdSpace::Singleton => &mut self.singleton_ids,
        };
        if let Some(&id) = ids.get(&type_id) {
            return Ok(id);
        }
        let id = ids.len();
        if id >= capacity {
            panic!("{} id space exhausted (max {capacity})", space.noun());
        }
        ids.insert(type_id, id as u32);
        Ok(id as u32)
    }
}
