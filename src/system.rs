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

//! System lifecycle traits and the per-tick context handed to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::command::{EntityCommandBuffer, WorkerBuffers};
use crate::filter::{ChunkAccessor, EntityFilter};
use crate::manager::EntityManager;
use crate::task::{TaskHandle, TaskManager};
use crate::time::Time;

/// A unit of work over one chunk.
///
/// `chunk_index` counts the chunks of one expansion; `first_entity_index` is
/// the running entity offset of this chunk within it. Structural mutations go
/// through the command buffer; the accessor's columns may be written per the
/// filter contract.
pub trait ChunkTask: Send + Sync {
    fn execute(
        &self,
        accessor: &ChunkAccessor,
        chunk_index: usize,
        first_entity_index: usize,
        buffer: &mut EntityCommandBuffer,
    );
}

/// Simulation system driven by the world's tick loop.
pub trait System: Send {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Runs once, on the tick after the system is registered.
    fn on_enter(&mut self, _ctx: &mut SystemContext<'_>) {}

    /// Runs every tick; schedules this tick's work.
    fn on_update(&mut self, ctx: &mut SystemContext<'_>);

    /// Runs once at shutdown.
    fn on_exit(&mut self, _ctx: &mut SystemContext<'_>) {}
}

/// The world facilities a system may touch during its lifecycle calls.
///
/// Holds the system's predecessor handle: the join of everything it has
/// scheduled this tick, awaited by the sync point that follows the system.
pub struct SystemContext<'a> {
    pub(crate) manager: &'a mut EntityManager,
    pub(crate) tasks: &'a TaskManager,
    pub(crate) time: &'a Time,
    pub(crate) quit: &'a AtomicBool,
    pub(crate) buffers: &'a Arc<WorkerBuffers>,
    pub(crate) predecessor: TaskHandle,
}

impl SystemContext<'_> {
    /// Immediate mutations are only safe while none of this system's tasks
    /// are in flight; after scheduling, defer through a command buffer.
    pub fn entity_manager(&mut self) -> &mut EntityManager {
        self.manager
    }

    pub fn time(&self) -> &Time {
        self.time
    }

    /// Ask the instance to stop after the current tick completes.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    pub fn predecessor(&self) -> &TaskHandle {
        &self.predecessor
    }

    pub fn set_predecessor(&mut self, handle: TaskHandle) {
        self.predecessor = handle;
    }

    /// Join several handles into one.
    pub fn combine(&self, handles: &[TaskHandle]) -> TaskHandle {
        self.tasks.combine(handles)
    }

    /// Fan `task` out over every chunk the filter matches, all ordered after
    /// `predecessor`; returns the join of the expansion.
    pub fn schedule(
        &mut self,
        task: Arc<dyn ChunkTask>,
        filter: &EntityFilter,
        predecessor: &TaskHandle,
    ) -> TaskHandle {
        let accessors = self.manager.filter_entities(filter);
        schedule_chunk_tasks(self.tasks, task, accessors, self.buffers, predecessor)
    }
}

pub(crate) fn schedule_chunk_tasks(
    tasks: &TaskManager,
    task: Arc<dyn ChunkTask>,
    accessors: Vec<ChunkAccessor>,
    buffers: &Arc<WorkerBuffers>,
    predecessor: &TaskHandle,
) -> TaskHandle {
    let mut handles = Vec::with_capacity(accessors.len());
    let mut first_entity_index = 0;
    for (chunk_index, accessor) in accessors.into_iter().enumerate() {
        let first = first_entity_index;
        first_entity_index += accessor.entity_count();
        let task = task.clone();
        let buffers = buffers.clone();
        handles.push(tasks.schedule(
            move |worker| {
                let mut buffer = buffers.lane(worker).lock();
                task.execute(&accessor, chunk_index, first, &mut buffer);
            },
            std::slice::from_ref(predecessor),
        ));
    }
    tasks.combine(&handles)
}
