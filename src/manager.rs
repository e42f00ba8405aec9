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

//! The entity manager: authoritative owner of entities, archetypes and the
//! shared/singleton stores.
//!
//! Immediate operations are legal only from the main thread or inside the
//! sync drain; during task execution the manager is read-only and all
//! structural mutation goes through command buffers.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::archetype::{Archetype, ArchetypeId, SharedIndexTuple};
use crate::chunk::ChunkPool;
use crate::command::{
    DrainPolicy, DrainReport, EntityCommand, EntityCommandBuffer, WorkerBuffers,
};
use crate::entity::{Entity, EntityIdAllocator, EntityLocation};
use crate::error::{EcsError, Result};
use crate::filter::{ChunkAccessor, EntityFilter};
use crate::mask::ArchetypeMask;
use crate::registry::{
    Component, ComponentDescriptor, SharedComponent, SingletonComponent, TypeRegistry,
};
use crate::store::{SharedComponentStore, SharedObject, SingletonComponentStore};

/// The archetype of entities with no components, created eagerly.
const EMPTY_ARCHETYPE: ArchetypeId = 0;

pub struct EntityManager {
    registry: TypeRegistry,
    chunk_pool: ChunkPool,
    shared_store: SharedComponentStore,
    singleton_store: SingletonComponentStore,
    archetype_lookup: AHashMap<ArchetypeMask, ArchetypeId>,
    archetypes: Vec<Archetype>,
    allocator: Arc<EntityIdAllocator>,
    entity_locations: Vec<EntityLocation>,
    main_buffer: EntityCommandBuffer,
}

impl EntityManager {
    pub fn new() -> Self {
        let allocator = Arc::new(EntityIdAllocator::new());
        let main_buffer = EntityCommandBuffer::new(allocator.clone());
        let mut manager = Self {
            registry: TypeRegistry::new(),
            chunk_pool: ChunkPool::new(),
            shared_store: SharedComponentStore::new(),
            singleton_store: SingletonComponentStore::new(),
            archetype_lookup: AHashMap::new(),
            archetypes: Vec::new(),
            allocator,
            entity_locations: Vec::new(),
            main_buffer,
        };
        let id = manager.archetype_for(
            ArchetypeMask::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        debug_assert_eq!(id, EMPTY_ARCHETYPE);
        manager
    }

    // ------------------------------------------------------------------
    // Type registration
    // ------------------------------------------------------------------

    /// Dense id of a component type; assigned on first call.
    ///
    /// # Panics
    /// Panics if the type is already registered under another
    /// classification, or the id space is exhausted.
    pub fn component_id<T: Component>(&mut self) -> u32 {
        self.registry
            .component_id::<T>()
            .unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn shared_component_id<T: SharedComponent>(&mut self) -> u32 {
        self.registry
            .shared_component_id::<T>()
            .unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn singleton_component_id<T: SingletonComponent>(&mut self) -> u32 {
        self.registry
            .singleton_component_id::<T>()
            .unwrap_or_else(|error| panic!("{error}"))
    }

    pub fn archetype_builder(&mut self) -> ArchetypeBuilder<'_> {
        ArchetypeBuilder {
            manager: self,
            mask: ArchetypeMask::default(),
            component_ids: Vec::new(),
            component_sizes: Vec::new(),
            component_aligns: Vec::new(),
            shared_component_ids: Vec::new(),
            error: None,
        }
    }

    pub fn filter_builder(&mut self) -> EntityFilterBuilder<'_> {
        EntityFilterBuilder {
            manager: self,
            filter: EntityFilter::default(),
            error: None,
        }
    }

    // ------------------------------------------------------------------
    // Entity lifecycle
    // ------------------------------------------------------------------

    /// Create an entity in the empty archetype.
    pub fn create_entity(&mut self) -> Entity {
        let entity = self.allocator.assign();
        self.create_entity_immediately(entity);
        entity
    }

    /// Create an entity in a given archetype. The archetype must not declare
    /// shared components; shared values arrive via
    /// [`add_shared_component`](Self::add_shared_component), which pins the
    /// destination combination.
    pub fn create_entity_in(&mut self, archetype: ArchetypeId) -> Result<Entity> {
        let entity = self.allocator.assign();
        match self.create_entity_in_immediately(entity, archetype) {
            Ok(()) => Ok(entity),
            Err(error) => {
                self.allocator.recycle(entity.id);
                Err(error)
            }
        }
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        self.destroy_entity_immediately(entity)
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.location_of(entity).is_ok()
    }

    /// Archetype the entity currently lives in.
    pub fn entity_archetype(&self, entity: Entity) -> Result<ArchetypeId> {
        Ok(self.location_of(entity)?.archetype_id)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        let descriptor = self.registry.descriptor::<T>()?;
        self.add_component_immediately(entity, descriptor, &component as *const T as *const u8)
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let component_id = self.registry.component_id::<T>()?;
        self.remove_component_immediately(entity, component_id)
    }

    pub fn set_component<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        let component_id = self.registry.component_id::<T>()?;
        self.set_component_immediately(entity, component_id, &component as *const T as *const u8)
    }

    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<T> {
        let location = self.location_of(entity)?;
        let component_id = self
            .registry
            .lookup_component_id(std::any::TypeId::of::<T>())
            .ok_or(EcsError::MissingComponent)?;
        let ptr = self.archetypes[location.archetype_id as usize]
            .component_ptr(location, component_id)
            .ok_or(EcsError::MissingComponent)?;
        // Column slots are aligned for T by layout construction.
        Ok(unsafe { std::ptr::read(ptr as *const T) })
    }

    // ------------------------------------------------------------------
    // Shared components
    // ------------------------------------------------------------------

    pub fn add_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<()> {
        let shared_component_id = self.registry.shared_component_id::<T>()?;
        self.add_shared_component_immediately(
            entity,
            shared_component_id,
            T::MANUAL,
            Box::new(value),
        )
    }

    pub fn remove_shared_component<T: SharedComponent>(&mut self, entity: Entity) -> Result<()> {
        let shared_component_id = self.registry.shared_component_id::<T>()?;
        self.remove_shared_component_immediately(entity, shared_component_id)
    }

    pub fn set_shared_component<T: SharedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<()> {
        let shared_component_id = self.registry.shared_component_id::<T>()?;
        self.set_shared_component_immediately(entity, shared_component_id, Box::new(value))
    }

    /// The interned value at a store index, as handed out by
    /// [`ChunkAccessor::shared_component_index`].
    pub fn shared_component<T: SharedComponent>(&self, index: u32) -> Option<&T> {
        self.shared_store.get::<T>(index)
    }

    /// Store index of an equal live value; does not intern.
    pub fn shared_component_index<T: SharedComponent>(&self, value: &T) -> Option<u32> {
        let shared_component_id = self
            .registry
            .lookup_shared_component_id(std::any::TypeId::of::<T>())?;
        self.shared_store.object_index(shared_component_id, value)
    }

    /// Live references to a store index; zero means the slot is free.
    pub fn shared_component_refcount(&self, index: u32) -> u32 {
        self.shared_store.refcount(index)
    }

    // ------------------------------------------------------------------
    // Singleton components
    // ------------------------------------------------------------------

    pub fn add_singleton<T: SingletonComponent>(&mut self, value: T) -> Result<()> {
        let id = self.registry.singleton_component_id::<T>()?;
        self.singleton_store.push(id, Box::new(value))
    }

    pub fn remove_singleton<T: SingletonComponent>(&mut self) -> Result<()> {
        let id = self.registry.singleton_component_id::<T>()?;
        self.singleton_store.pop(id)
    }

    pub fn set_singleton<T: SingletonComponent>(&mut self, value: T) -> Result<()> {
        let id = self.registry.singleton_component_id::<T>()?;
        self.singleton_store.set(id, Box::new(value))
    }

    pub fn singleton<T: SingletonComponent>(&self) -> Option<&T> {
        let id = self
            .registry
            .lookup_singleton_component_id(std::any::TypeId::of::<T>())?;
        self.singleton_store.get::<T>(id)
    }

    pub fn singleton_mut<T: SingletonComponent>(&mut self) -> Option<&mut T> {
        let id = self
            .registry
            .lookup_singleton_component_id(std::any::TypeId::of::<T>())?;
        self.singleton_store.get_mut::<T>(id)
    }

    // ------------------------------------------------------------------
    // Filtering
    // ------------------------------------------------------------------

    /// One accessor per chunk of every matched combination.
    pub fn filter_entities(&self, filter: &EntityFilter) -> Vec<ChunkAccessor> {
        let mut accessors = Vec::new();
        for archetype in &self.archetypes {
            if filter.matches_archetype(archetype.mask()) {
                archetype.filter_entities(filter, &mut accessors);
            }
        }
        accessors
    }

    pub fn chunk_count(&self, filter: &EntityFilter) -> usize {
        self.filtered_counts(filter).0
    }

    pub fn entity_count(&self, filter: &EntityFilter) -> usize {
        self.filtered_counts(filter).1
    }

    fn filtered_counts(&self, filter: &EntityFilter) -> (usize, usize) {
        let mut chunks = 0;
        let mut entities = 0;
        for archetype in &self.archetypes {
            if filter.matches_archetype(archetype.mask()) {
                let (archetype_chunks, archetype_entities) = archetype.filtered_counts(filter);
                chunks += archetype_chunks;
                entities += archetype_entities;
            }
        }
        (chunks, entities)
    }

    // ------------------------------------------------------------------
    // Deferred mutation
    // ------------------------------------------------------------------

    /// The main thread's command buffer, drained first at every sync point.
    pub fn main_command_buffer(&mut self) -> &mut EntityCommandBuffer {
        &mut self.main_buffer
    }

    pub(crate) fn allocator(&self) -> &Arc<EntityIdAllocator> {
        &self.allocator
    }

    /// Replay every recorded command: main buffer first, then workers in
    /// worker-id order, FIFO within each buffer. Buffers are left empty.
    pub(crate) fn drain_command_buffers(
        &mut self,
        buffers: &WorkerBuffers,
        policy: DrainPolicy,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        let commands = self.main_buffer.take_commands();
        let mut aborted = self.replay(commands, None, policy, &mut report);
        for worker in 0..buffers.lane_count() {
            let commands = buffers.lane(worker).lock().take_commands();
            if aborted {
                self.recycle_created(commands);
                continue;
            }
            aborted = self.replay(commands, Some(worker as u32), policy, &mut report);
        }
        report
    }

    fn replay(
        &mut self,
        commands: Vec<EntityCommand>,
        worker: Option<u32>,
        policy: DrainPolicy,
        report: &mut DrainReport,
    ) -> bool {
        let mut commands = commands.into_iter().enumerate();
        while let Some((index, command)) = commands.next() {
            if let Err(source) = self.apply(command) {
                warn!(
                    worker = worker.map(|worker| worker as i64).unwrap_or(-1),
                    index,
                    error = %source,
                    "deferred command failed"
                );
                report.errors.push(EcsError::Command {
                    worker,
                    index,
                    source: Box::new(source),
                });
                match policy {
                    DrainPolicy::LogAndSkip => continue,
                    DrainPolicy::Abort | DrainPolicy::LogAndSkipBuffer => {
                        self.recycle_created(commands.map(|(_, command)| command));
                        return policy == DrainPolicy::Abort;
                    }
                }
            }
        }
        false
    }

    /// Retire ids whose `Create` commands were abandoned so the handles a
    /// task already observed can never resolve.
    fn recycle_created(&mut self, commands: impl IntoIterator<Item = EntityCommand>) {
        for command in commands {
            match command {
                EntityCommand::Create(entity) | EntityCommand::CreateIn(entity, _) => {
                    self.allocator.recycle(entity.id);
                }
                _ => {}
            }
        }
    }

    fn apply(&mut self, command: EntityCommand) -> Result<()> {
        match command {
            EntityCommand::Create(entity) => {
                self.create_entity_immediately(entity);
                Ok(())
            }
            EntityCommand::CreateIn(entity, archetype) => {
                self.create_entity_in_immediately(entity, archetype)
            }
            EntityCommand::Destroy(entity) => self.destroy_entity_immediately(entity),
            EntityCommand::AddComponent(entity, record) => {
                let id = self
                    .registry
                    .component_id_dynamic(record.key.type_id, record.key.type_name)?;
                let descriptor = ComponentDescriptor {
                    id,
                    size: record.size,
                    align: record.align,
                    manual: record.manual,
                };
                self.add_component_immediately(entity, descriptor, record.data.as_ptr())
            }
            EntityCommand::RemoveComponent(entity, key) => {
                let id = self.registry.component_id_dynamic(key.type_id, key.type_name)?;
                self.remove_component_immediately(entity, id)
            }
            EntityCommand::SetComponent(entity, record) => {
                let id = self
                    .registry
                    .component_id_dynamic(record.key.type_id, record.key.type_name)?;
                self.set_component_immediately(entity, id, record.data.as_ptr())
            }
            EntityCommand::AddSharedComponent(entity, key, manual, value) => {
                let id = self
                    .registry
                    .shared_component_id_dynamic(key.type_id, key.type_name)?;
                self.add_shared_component_immediately(entity, id, manual, value)
            }
            EntityCommand::RemoveSharedComponent(entity, key) => {
                let id = self
                    .registry
                    .shared_component_id_dynamic(key.type_id, key.type_name)?;
                self.remove_shared_component_immediately(entity, id)
            }
            EntityCommand::SetSharedComponent(entity, key, value) => {
                let id = self
                    .registry
                    .shared_component_id_dynamic(key.type_id, key.type_name)?;
                self.set_shared_component_immediately(entity, id, value)
            }
            EntityCommand::AddSingleton(key, value) => {
                let id = self
                    .registry
                    .singleton_component_id_dynamic(key.type_id, key.type_name)?;
                self.singleton_store.push(id, value)
            }
            EntityCommand::RemoveSingleton(key) => {
                let id = self
                    .registry
                    .singleton_component_id_dynamic(key.type_id, key.type_name)?;
                self.singleton_store.pop(id)
            }
            EntityCommand::SetSingleton(key, value) => {
                let id = self
                    .registry
                    .singleton_component_id_dynamic(key.type_id, key.type_name)?;
                self.singleton_store.set(id, value)
            }
        }
    }

    // ------------------------------------------------------------------
    // Immediate operations
    // ------------------------------------------------------------------

    fn location_of(&self, entity: Entity) -> Result<EntityLocation> {
        if !self.allocator.handle_current(entity) {
            return Err(EcsError::InvalidEntity);
        }
        let location = self
            .entity_locations
            .get(entity.id as usize)
            .copied()
            .unwrap_or(EntityLocation::INVALID);
        if !location.valid() {
            // Reserved in a command buffer but not created yet.
            return Err(EcsError::InvalidEntity);
        }
        debug_assert_eq!(
            self.archetypes[location.archetype_id as usize].entity_at(location),
            entity
        );
        Ok(location)
    }

    fn create_entity_immediately(&mut self, entity: Entity) {
        let location =
            self.archetypes[EMPTY_ARCHETYPE as usize].add_entity(entity, &mut self.chunk_pool);
        self.store_location(entity, location);
    }

    fn create_entity_in_immediately(
        &mut self,
        entity: Entity,
        archetype: ArchetypeId,
    ) -> Result<()> {
        let target = &mut self.archetypes[archetype as usize];
        if !target.shared_component_ids().is_empty() {
            return Err(EcsError::TypeContract(
                "cannot create an entity directly in an archetype with shared components"
                    .to_string(),
            ));
        }
        let location = target.add_entity(entity, &mut self.chunk_pool);
        self.store_location(entity, location);
        Ok(())
    }

    fn destroy_entity_immediately(&mut self, entity: Entity) -> Result<()> {
        let location = self.location_of(entity)?;
        let archetype = &self.archetypes[location.archetype_id as usize];
        if archetype.mask().any_manual() && !archetype.fully_manual() {
            // Manual components keep the entity alive: strip everything else.
            self.strip_to_manual(entity, location)
        } else {
            self.destroy_without_check(entity, location);
            Ok(())
        }
    }

    fn add_component_immediately(
        &mut self,
        entity: Entity,
        descriptor: ComponentDescriptor,
        component: *const u8,
    ) -> Result<()> {
        let location = self.location_of(entity)?;
        let src_id = location.archetype_id;
        let src = &self.archetypes[src_id as usize];
        if src.mask().contains_component(descriptor.id) {
            return Err(EcsError::ComponentAlreadyPresent);
        }

        let mut mask = *src.mask();
        mask.mark_component(descriptor.id, descriptor.manual);
        let dst_id = match self.archetype_lookup.get(&mask) {
            Some(&dst_id) => dst_id,
            None => {
                let src = &self.archetypes[src_id as usize];
                let mut component_ids = src.component_ids().to_vec();
                let mut component_sizes = src.component_sizes().to_vec();
                let mut component_aligns = src.component_aligns().to_vec();
                component_ids.push(descriptor.id);
                component_sizes.push(descriptor.size);
                component_aligns.push(descriptor.align);
                let shared_component_ids = src.shared_component_ids().to_vec();
                self.archetype_for(
                    mask,
                    component_ids,
                    component_sizes,
                    component_aligns,
                    shared_component_ids,
                )
            }
        };

        let (dst, src) = archetype_pair_mut(&mut self.archetypes, dst_id, src_id);
        let (dst_location, swapped) = Archetype::move_entity_adding_component(
            dst,
            src,
            location,
            descriptor.id,
            component,
            &mut self.chunk_pool,
        );
        self.patch_locations(entity, dst_location, location, swapped);
        Ok(())
    }

    fn remove_component_immediately(&mut self, entity: Entity, component_id: u32) -> Result<()> {
        let location = self.location_of(entity)?;
        let src_id = location.archetype_id;
        let src = &self.archetypes[src_id as usize];
        if !src.mask().contains_component(component_id) {
            return Err(EcsError::MissingComponent);
        }
        // Removing the last component of a fully manual archetype is the
        // manual-collapse idiom: the entity dies instead of moving.
        if src.single() && src.fully_manual() {
            self.destroy_without_check(entity, location);
            return Ok(());
        }

        let mut mask = *src.mask();
        mask.clear_component(component_id);
        let dst_id = match self.archetype_lookup.get(&mask) {
            Some(&dst_id) => dst_id,
            None => {
                let src = &self.archetypes[src_id as usize];
                let mut component_ids = Vec::with_capacity(src.component_ids().len() - 1);
                let mut component_sizes = Vec::with_capacity(src.component_ids().len() - 1);
                let mut component_aligns = Vec::with_capacity(src.component_ids().len() - 1);
                for (at, &id) in src.component_ids().iter().enumerate() {
                    if id != component_id {
                        component_ids.push(id);
                        component_sizes.push(src.component_sizes()[at]);
                        component_aligns.push(src.component_aligns()[at]);
                    }
                }
                let shared_component_ids = src.shared_component_ids().to_vec();
                self.archetype_for(
                    mask,
                    component_ids,
                    component_sizes,
                    component_aligns,
                    shared_component_ids,
                )
            }
        };

        let (dst, src) = archetype_pair_mut(&mut self.archetypes, dst_id, src_id);
        let (dst_location, swapped) =
            Archetype::move_entity_removing_component(dst, src, location, &mut self.chunk_pool);
        self.patch_locations(entity, dst_location, location, swapped);
        Ok(())
    }

    fn set_component_immediately(
        &mut self,
        entity: Entity,
        component_id: u32,
        component: *const u8,
    ) -> Result<()> {
        let location = self.location_of(entity)?;
        let archetype = &mut self.archetypes[location.archetype_id as usize];
        if !archetype.mask().contains_component(component_id) {
            return Err(EcsError::MissingComponent);
        }
        archetype.set_component(location, component_id, component);
        Ok(())
    }

    fn add_shared_component_immediately(
        &mut self,
        entity: Entity,
        shared_component_id: u32,
        manual: bool,
        value: Box<dyn SharedObject>,
    ) -> Result<()> {
        let location = self.location_of(entity)?;
        let src_id = location.archetype_id;
        let src = &self.archetypes[src_id as usize];
        if src.mask().contains_shared_component(shared_component_id) {
            return Err(EcsError::SharedComponentAlreadyPresent);
        }

        let mut mask = *src.mask();
        mask.mark_shared_component(shared_component_id, manual);
        let dst_id = match self.archetype_lookup.get(&mask) {
            Some(&dst_id) => dst_id,
            None => {
                let src = &self.archetypes[src_id as usize];
                let component_ids = src.component_ids().to_vec();
                let component_sizes = src.component_sizes().to_vec();
                let component_aligns = src.component_aligns().to_vec();
                let mut shared_component_ids = src.shared_component_ids().to_vec();
                shared_component_ids.push(shared_component_id);
                self.archetype_for(
                    mask,
                    component_ids,
                    component_sizes,
                    component_aligns,
                    shared_component_ids,
                )
            }
        };

        let shared_component_index = self.shared_store.push_boxed(shared_component_id, value);
        let (dst, src) = archetype_pair_mut(&mut self.archetypes, dst_id, src_id);
        let (dst_location, swapped) = Archetype::move_entity_adding_shared_component(
            dst,
            src,
            location,
            shared_component_id,
            shared_component_index,
            &mut self.chunk_pool,
        );
        self.patch_locations(entity, dst_location, location, swapped);
        Ok(())
    }

    fn remove_shared_component_immediately(
        &mut self,
        entity: Entity,
        shared_component_id: u32,
    ) -> Result<()> {
        let location = self.location_of(entity)?;
        let src_id = location.archetype_id;
        let src = &self.archetypes[src_id as usize];
        if !src.mask().contains_shared_component(shared_component_id) {
            return Err(EcsError::MissingSharedComponent);
        }
        if src.single() && src.fully_manual() {
            self.destroy_without_check(entity, location);
            return Ok(());
        }

        let mut mask = *src.mask();
        mask.clear_shared_component(shared_component_id);
        let dst_id = match self.archetype_lookup.get(&mask) {
            Some(&dst_id) => dst_id,
            None => {
                let src = &self.archetypes[src_id as usize];
                let component_ids = src.component_ids().to_vec();
                let component_sizes = src.component_sizes().to_vec();
                let component_aligns = src.component_aligns().to_vec();
                let shared_component_ids = src
                    .shared_component_ids()
                    .iter()
                    .copied()
                    .filter(|&id| id != shared_component_id)
                    .collect();
                self.archetype_for(
                    mask,
                    component_ids,
                    component_sizes,
                    component_aligns,
                    shared_component_ids,
                )
            }
        };

        let (dst, src) = archetype_pair_mut(&mut self.archetypes, dst_id, src_id);
        let (removed_index, dst_location, swapped) =
            Archetype::move_entity_removing_shared_component(
                dst,
                src,
                location,
                shared_component_id,
                &mut self.chunk_pool,
            );
        self.patch_locations(entity, dst_location, location, swapped);
        self.shared_store.pop(shared_component_id, removed_index);
        Ok(())
    }

    fn set_shared_component_immediately(
        &mut self,
        entity: Entity,
        shared_component_id: u32,
        value: Box<dyn SharedObject>,
    ) -> Result<()> {
        let location = self.location_of(entity)?;
        let archetype_id = location.archetype_id;
        if !self.archetypes[archetype_id as usize]
            .mask()
            .contains_shared_component(shared_component_id)
        {
            return Err(EcsError::MissingSharedComponent);
        }

        // Setting the value an entity already has nets out: the push below
        // bumps the refcount, the move short-circuits, and the pop of the
        // "replaced" (identical) index undoes the bump.
        let new_index = self.shared_store.push_boxed(shared_component_id, value);
        let (original_index, dst_location, swapped) = self.archetypes[archetype_id as usize]
            .set_shared_component(location, shared_component_id, new_index, &mut self.chunk_pool);
        self.patch_locations(entity, dst_location, location, swapped);
        self.shared_store.pop(shared_component_id, original_index);
        Ok(())
    }

    /// Drop every non-manual component and shared component in one move,
    /// releasing the dropped shared references.
    fn strip_to_manual(&mut self, entity: Entity, location: EntityLocation) -> Result<()> {
        let src_id = location.archetype_id;
        let src = &self.archetypes[src_id as usize];

        let mut mask = ArchetypeMask::default();
        let mut component_ids = Vec::new();
        let mut component_sizes = Vec::new();
        let mut component_aligns = Vec::new();
        for (at, &id) in src.component_ids().iter().enumerate() {
            if src.mask().is_manual_component(id) {
                mask.mark_component(id, true);
                component_ids.push(id);
                component_sizes.push(src.component_sizes()[at]);
                component_aligns.push(src.component_aligns()[at]);
            }
        }
        let mut shared_component_ids = Vec::new();
        for &id in src.shared_component_ids() {
            if src.mask().is_manual_shared_component(id) {
                mask.mark_shared_component(id, true);
                shared_component_ids.push(id);
            }
        }

        let src_tuple: SharedIndexTuple =
            SmallVec::from_slice(src.shared_indices_at(location.combination_index));
        let mut tuple = SharedIndexTuple::new();
        let mut dropped: SmallVec<[(u32, u32); 4]> = SmallVec::new();
        for (at, &id) in src.shared_component_ids().iter().enumerate() {
            if src.mask().is_manual_shared_component(id) {
                tuple.push(src_tuple[at]);
            } else {
                dropped.push((id, src_tuple[at]));
            }
        }

        let dst_id = match self.archetype_lookup.get(&mask) {
            Some(&dst_id) => dst_id,
            None => self.archetype_for(
                mask,
                component_ids,
                component_sizes,
                component_aligns,
                shared_component_ids,
            ),
        };

        let (dst, src) = archetype_pair_mut(&mut self.archetypes, dst_id, src_id);
        let (dst_location, swapped) =
            Archetype::move_entity_into_tuple(dst, src, location, tuple, &mut self.chunk_pool);
        self.patch_locations(entity, dst_location, location, swapped);
        for (shared_component_id, index) in dropped {
            self.shared_store.pop(shared_component_id, index);
        }
        Ok(())
    }

    fn destroy_without_check(&mut self, entity: Entity, location: EntityLocation) {
        let archetype = &mut self.archetypes[location.archetype_id as usize];
        let shared_component_ids: SmallVec<[u32; 4]> =
            SmallVec::from_slice(archetype.shared_component_ids());
        let (tuple, swapped) = archetype.remove_entity(location, &mut self.chunk_pool);
        for (at, &shared_component_id) in shared_component_ids.iter().enumerate() {
            self.shared_store.pop(shared_component_id, tuple[at]);
        }
        self.entity_locations[entity.id as usize] = EntityLocation::INVALID;
        if swapped.valid() {
            self.entity_locations[swapped.id as usize] = location;
        }
        self.allocator.recycle(entity.id);
    }

    fn patch_locations(
        &mut self,
        entity: Entity,
        dst_location: EntityLocation,
        src_location: EntityLocation,
        swapped: Entity,
    ) {
        self.entity_locations[entity.id as usize] = dst_location;
        if swapped.valid() {
            self.entity_locations[swapped.id as usize] = src_location;
        }
    }

    fn store_location(&mut self, entity: Entity, location: EntityLocation) {
        let at = entity.id as usize;
        if at >= self.entity_locations.len() {
            self.entity_locations.resize(at + 1, EntityLocation::INVALID);
        }
        self.entity_locations[at] = location;
    }

    fn archetype_for(
        &mut self,
        mask: ArchetypeMask,
        component_ids: Vec<u32>,
        component_sizes: Vec<usize>,
        component_aligns: Vec<usize>,
        shared_component_ids: Vec<u32>,
    ) -> ArchetypeId {
        if let Some(&id) = self.archetype_lookup.get(&mask) {
            return id;
        }
        let id = self.archetypes.len() as ArchetypeId;
        debug!(
            archetype = id,
            components = component_ids.len(),
            shared_components = shared_component_ids.len(),
            "creating archetype"
        );
        self.archetypes.push(Archetype::new(
            id,
            mask,
            component_ids,
            component_sizes,
            component_aligns,
            shared_component_ids,
        ));
        self.archetype_lookup.insert(mask, id);
        id
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

fn archetype_pair_mut(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    debug_assert_ne!(a, b);
    let (a, b) = (a as usize, b as usize);
    if a < b {
        let (head, tail) = archetypes.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = archetypes.split_at_mut(a);
        (&mut tail[0], &mut head[b])
    }
}

/// Collects the component signature of a new archetype, then builds or reuses
/// it. Registration errors are deferred to [`build`](Self::build).
pub struct ArchetypeBuilder<'a> {
    manager: &'a mut EntityManager,
    mask: ArchetypeMask,
    component_ids: Vec<u32>,
    component_sizes: Vec<usize>,
    component_aligns: Vec<usize>,
    shared_component_ids: Vec<u32>,
    error: Option<EcsError>,
}

impl ArchetypeBuilder<'_> {
    pub fn mark_component<T: Component>(mut self) -> Self {
        match self.manager.registry.component_id::<T>() {
            Ok(id) => {
                if !self.mask.contains_component(id) {
                    self.mask.mark_component(id, T::MANUAL);
                    self.component_ids.push(id);
                    self.component_sizes.push(std::mem::size_of::<T>());
                    self.component_aligns.push(std::mem::align_of::<T>());
                }
            }
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn mark_shared_component<T: SharedComponent>(mut self) -> Self {
        match self.manager.registry.shared_component_id::<T>() {
            Ok(id) => {
                if !self.mask.contains_shared_component(id) {
                    self.mask.mark_shared_component(id, T::MANUAL);
                    self.shared_component_ids.push(id);
                }
            }
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn build(self) -> Result<ArchetypeId> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(self.manager.archetype_for(
            self.mask,
            self.component_ids,
            self.component_sizes,
            self.component_aligns,
            self.shared_component_ids,
        ))
    }
}

/// Collects require/reject predicates into an [`EntityFilter`].
pub struct EntityFilterBuilder<'a> {
    manager: &'a mut EntityManager,
    filter: EntityFilter,
    error: Option<EcsError>,
}

impl EntityFilterBuilder<'_> {
    pub fn require<T: Component>(mut self) -> Self {
        match self.manager.registry.component_id::<T>() {
            Ok(id) => self.filter.required_components.set(id),
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn reject<T: Component>(mut self) -> Self {
        match self.manager.registry.component_id::<T>() {
            Ok(id) => self.filter.rejected_components.set(id),
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn require_shared<T: SharedComponent>(mut self) -> Self {
        match self.manager.registry.shared_component_id::<T>() {
            Ok(id) => self.filter.required_shared_components.set(id),
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn reject_shared<T: SharedComponent>(mut self) -> Self {
        match self.manager.registry.shared_component_id::<T>() {
            Ok(id) => self.filter.rejected_shared_components.set(id),
            Err(error) => self.error = Some(error),
        }
        self
    }

    /// Require the exact interned value. A value that was never interned
    /// matches nothing.
    pub fn require_shared_value<T: SharedComponent>(mut self, value: &T) -> Self {
        match self.shared_pair(value) {
            Ok(pair) => self.filter.required_shared_id_indices.push(pair),
            Err(error) => self.error = Some(error),
        }
        self
    }

    /// Reject the exact interned value. A value that was never interned
    /// rejects nothing.
    pub fn reject_shared_value<T: SharedComponent>(mut self, value: &T) -> Self {
        match self.shared_pair(value) {
            Ok(pair) => self.filter.rejected_shared_id_indices.push(pair),
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn build(mut self) -> Result<EntityFilter> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.filter.required_shared_id_indices.sort_unstable();
        self.filter.rejected_shared_id_indices.sort_unstable();
        Ok(self.filter)
    }

    fn shared_pair<T: SharedComponent>(&mut self, value: &T) -> Result<(u32, u32)> {
        let shared_component_id = self.manager.registry.shared_component_id::<T>()?;
        let index = self
            .manager
            .shared_store
            .object_index(shared_component_id, value)
            // Never matches a real store index.
            .unwrap_or(u32::MAX);
        Ok((shared_component_id, index))
    }
}
