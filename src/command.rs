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

//! Deferred structural mutations.
//!
//! Each worker owns one command buffer (plus one for the main thread);
//! recording never takes a contended lock. Commands are a tagged enum with
//! inline payload bytes; replay at the sync drain is a single `match` per
//! command, in main-buffer-first, then worker-id order, FIFO within a buffer.
//!
//! Entity ids are reserved at record time from a leased batch so a created
//! entity's id is already final when its `Create` command replays.

use std::any::{Any, TypeId};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::archetype::ArchetypeId;
use crate::entity::{Entity, EntityIdAllocator, IdLease, ID_LEASE_SIZE};
use crate::error::EcsError;
use crate::registry::{Component, SharedComponent, SingletonComponent};
use crate::store::SharedObject;

/// Inline storage for one component's bytes; spills for large components.
pub(crate) type ComponentBytes = SmallVec<[u8; 32]>;

/// Type identity carried through the type-erased command log; the id is
/// resolved against the registry at drain time, on the main thread.
pub(crate) struct TypeKey {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl TypeKey {
    fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Everything the drain needs to add or set one component.
pub(crate) struct ComponentRecord {
    pub key: TypeKey,
    pub size: usize,
    pub align: usize,
    pub manual: bool,
    pub data: ComponentBytes,
}

pub(crate) enum EntityCommand {
    Create(Entity),
    CreateIn(Entity, ArchetypeId),
    Destroy(Entity),
    AddComponent(Entity, ComponentRecord),
    RemoveComponent(Entity, TypeKey),
    SetComponent(Entity, ComponentRecord),
    AddSharedComponent(Entity, TypeKey, bool, Box<dyn SharedObject>),
    RemoveSharedComponent(Entity, TypeKey),
    SetSharedComponent(Entity, TypeKey, Box<dyn SharedObject>),
    AddSingleton(TypeKey, Box<dyn Any + Send + Sync>),
    RemoveSingleton(TypeKey),
    SetSingleton(TypeKey, Box<dyn Any + Send + Sync>),
}

/// What the drain does with a failing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Stop draining and surface the failure.
    #[default]
    Abort,
    /// Log the failure and continue with the next command.
    LogAndSkip,
    /// Log the failure and abandon the rest of the failing buffer.
    LogAndSkipBuffer,
}

/// Failures collected by one sync drain, tagged with the recording buffer and
/// the command index within it.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub errors: Vec<EcsError>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-worker log of pending structural mutations.
pub struct EntityCommandBuffer {
    allocator: Arc<EntityIdAllocator>,
    lease: IdLease,
    commands: Vec<EntityCommand>,
}

impl EntityCommandBuffer {
    pub(crate) fn new(allocator: Arc<EntityIdAllocator>) -> Self {
        Self {
            allocator,
            lease: IdLease::empty(),
            commands: Vec::new(),
        }
    }

    /// Reserve an entity id and queue its creation in the empty archetype.
    /// The returned handle is valid for recording immediately; it resolves
    /// after the drain.
    pub fn create_entity(&mut self) -> Entity {
        let entity = self.reserve();
        self.commands.push(EntityCommand::Create(entity));
        entity
    }

    /// As [`create_entity`](Self::create_entity), but in a given archetype.
    pub fn create_entity_in(&mut self, archetype: ArchetypeId) -> Entity {
        let entity = self.reserve();
        self.commands.push(EntityCommand::CreateIn(entity, archetype));
        entity
    }

    pub fn destroy_entity(&mut self, entity: Entity) {
        self.commands.push(EntityCommand::Destroy(entity));
    }

    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) {
        self.commands
            .push(EntityCommand::AddComponent(entity, record(component)));
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        self.commands
            .push(EntityCommand::RemoveComponent(entity, TypeKey::of::<T>()));
    }

    pub fn set_component<T: Component>(&mut self, entity: Entity, component: T) {
        self.commands
            .push(EntityCommand::SetComponent(entity, record(component)));
    }

    pub fn add_shared_component<T: SharedComponent>(&mut self, entity: Entity, value: T) {
        self.commands.push(EntityCommand::AddSharedComponent(
            entity,
            TypeKey::of::<T>(),
            T::MANUAL,
            Box::new(value),
        ));
    }

    pub fn remove_shared_component<T: SharedComponent>(&mut self, entity: Entity) {
        self.commands
            .push(EntityCommand::RemoveSharedComponent(entity, TypeKey::of::<T>()));
    }

    pub fn set_shared_component<T: SharedComponent>(&mut self, entity: Entity, value: T) {
        self.commands.push(EntityCommand::SetSharedComponent(
            entity,
            TypeKey::of::<T>(),
            Box::new(value),
        ));
    }

    pub fn add_singleton<T: SingletonComponent>(&mut self, value: T) {
        self.commands
            .push(EntityCommand::AddSingleton(TypeKey::of::<T>(), Box::new(value)));
    }

    pub fn remove_singleton<T: SingletonComponent>(&mut self) {
        self.commands
            .push(EntityCommand::RemoveSingleton(TypeKey::of::<T>()));
    }

    pub fn set_singleton<T: SingletonComponent>(&mut self, value: T) {
        self.commands
            .push(EntityCommand::SetSingleton(TypeKey::of::<T>(), Box::new(value)));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Hand the recorded commands to the drain and return unused reserved
    /// ids to the allocator.
    pub(crate) fn take_commands(&mut self) -> Vec<EntityCommand> {
        self.allocator.restore(&mut self.lease);
        std::mem::take(&mut self.commands)
    }

    fn reserve(&mut self) -> Entity {
        if self.lease.exhausted() {
            self.lease = self.allocator.lease(ID_LEASE_SIZE);
        }
        self.lease.pop().expect("fresh id lease is empty")
    }
}

fn record<T: Component>(component: T) -> ComponentRecord {
    let size = std::mem::size_of::<T>();
    // Components are Copy: a byte copy is the value.
    let data = unsafe {
        ComponentBytes::from_slice(std::slice::from_raw_parts(
            &component as *const T as *const u8,
            size,
        ))
    };
    ComponentRecord {
        key: TypeKey::of::<T>(),
        size,
        align: std::mem::align_of::<T>(),
        manual: T::MANUAL,
        data,
    }
}

/// The per-worker buffer lanes shared between the world and chunk tasks.
///
/// Each lane's mutex is held by its owning worker during a task and by the
/// main thread during the drain, never both: the drain only starts after the
/// phase's tasks are joined.
pub(crate) struct WorkerBuffers {
    lanes: Vec<Mutex<EntityCommandBuffer>>,
}

impl WorkerBuffers {
    pub fn new(worker_count: usize, allocator: &Arc<EntityIdAllocator>) -> Self {
        Self {
            lanes: (0..worker_count)
                .map(|_| Mutex::new(EntityCommandBuffer::new(allocator.clone())))
                .collect(),
        }
    }

    pub fn lane(&self, worker: usize) -> &Mutex<EntityCommandBuffer> {
        &self.lanes[worker]
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Health(u32);
    impl Component for Health {}

    #[test]
    fn test_created_ids_are_reserved_at_record_time() {
        let allocator = Arc::new(EntityIdAllocator::new());
        let mut buffer = EntityCommandBuffer::new(allocator.clone());

        let a = buffer.create_entity();
        let b = buffer.create_entity();
        assert_ne!(a, b);
        assert!(allocator.handle_current(a));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_unused_lease_returns_on_take() {
        let allocator = Arc::new(EntityIdAllocator::new());
        let mut buffer = EntityCommandBuffer::new(allocator.clone());
        let created = buffer.create_entity();
        let commands = buffer.take_commands();
        assert_eq!(commands.len(), 1);

        // Everything reserved but uncreated is available again; the created
        // id stays claimed.
        let fresh = allocator.assign();
        assert_ne!(fresh.id, created.id);
        assert!(fresh.id < ID_LEASE_SIZE as u32);
    }

    #[test]
    fn test_component_bytes_round_trip() {
        let allocator = Arc::new(EntityIdAllocator::new());
        let mut buffer = EntityCommandBuffer::new(allocator);
        let entity = buffer.create_entity();
        buffer.add_component(entity, Health(77));

        let commands = buffer.take_commands();
        match &commands[1] {
            EntityCommand::AddComponent(target, record) => {
                assert_eq!(*target, entity);
                assert_eq!(record.size, std::mem::size_of::<Health>());
                let value =
                    unsafe { std::ptr::read_unaligned(record.data.as_ptr() as *const Health) };
                assert_eq!(value, Health(77));
            }
            _ => panic!("expected an AddComponent command"),
        }
    }
}
