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

//! Chunked archetype ECS with a DAG task scheduler.
//!
//! Entities are versioned ids; their state lives in 16 KiB SoA chunks grouped
//! by archetype and, within an archetype, by exact shared-component tuple
//! (combinations). Systems schedule per-chunk tasks over a worker pool with
//! explicit predecessor edges; structural mutations are recorded into
//! per-worker command buffers and replayed deterministically at the sync
//! point between systems.

pub mod archetype;
pub mod chunk;
pub mod combination;
pub mod command;
pub mod entity;
pub mod error;
pub mod filter;
pub mod instance;
pub mod manager;
pub mod mask;
pub mod registry;
pub mod store;
pub mod system;
pub mod task;
pub mod time;
pub mod world;

// Re-exports for convenience
pub use archetype::ArchetypeId;
pub use command::{DrainPolicy, DrainReport, EntityCommandBuffer};
pub use entity::Entity;
pub use error::{EcsError, Result};
pub use filter::{ChunkAccessor, EntityFilter};
pub use instance::Instance;
pub use manager::{ArchetypeBuilder, EntityFilterBuilder, EntityManager};
pub use registry::{Component, SharedComponent, SingletonComponent};
pub use system::{ChunkTask, System, SystemContext};
pub use task::{TaskHandle, TaskManager};
pub use time::Time;
pub use world::{World, WorldConfig};
