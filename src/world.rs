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

//! The world: systems, the tick loop, and the sync points between them.
//!
//! Each tick runs every system's `on_update` in registration order. After a
//! system returns, the runtime waits on the system's predecessor handle,
//! drains every command buffer (main first, then workers in id order) and
//! clears them; the next system observes the post-drain world. Ids freed
//! during the tick become reusable only when the tick ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::command::{DrainPolicy, EntityCommandBuffer, WorkerBuffers};
use crate::error::Result;
use crate::manager::EntityManager;
use crate::system::{System, SystemContext};
use crate::task::{TaskHandle, TaskManager};
use crate::time::Time;

/// Tuning knobs for a world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Worker threads in the task pool.
    pub worker_count: usize,
    /// What the sync drain does with failing commands.
    pub drain_policy: DrainPolicy,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4),
            drain_policy: DrainPolicy::default(),
        }
    }
}

struct SystemEntry {
    system: Box<dyn System>,
    entered: bool,
}

pub struct World {
    // Declared before `manager`: dropping the pool joins the workers before
    // the chunk storage their accessors point into goes away.
    tasks: TaskManager,
    manager: EntityManager,
    buffers: Arc<WorkerBuffers>,
    systems: Vec<SystemEntry>,
    time: Time,
    quit: AtomicBool,
    config: WorldConfig,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let manager = EntityManager::new();
        let tasks = TaskManager::new(config.worker_count);
        let buffers = Arc::new(WorkerBuffers::new(tasks.worker_count(), manager.allocator()));
        Self {
            tasks,
            manager,
            buffers,
            systems: Vec::new(),
            time: Time::new(),
            quit: AtomicBool::new(false),
            config,
        }
    }

    /// Register a system; its `on_enter` runs at the start of the next tick.
    pub fn register_system(&mut self, system: Box<dyn System>) {
        self.systems.push(SystemEntry {
            system,
            entered: false,
        });
    }

    pub fn entity_manager(&mut self) -> &mut EntityManager {
        &mut self.manager
    }

    pub fn time(&self) -> &Time {
        &self.time
    }

    /// Cooperative shutdown: the in-flight tick completes normally.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    /// Borrow one worker's command buffer from the main thread, outside any
    /// running phase.
    pub fn with_worker_buffer<R>(
        &self,
        worker: usize,
        record: impl FnOnce(&mut EntityCommandBuffer) -> R,
    ) -> R {
        let mut buffer = self.buffers.lane(worker).lock();
        record(&mut buffer)
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.worker_count()
    }

    /// A manual sync point: drain every command buffer now.
    pub fn flush(&mut self) -> Result<()> {
        self.sync(TaskHandle::completed())
    }

    /// Run one tick: clock update, enter phase for new systems, then each
    /// system's update followed by its sync point.
    pub fn tick(&mut self) -> Result<()> {
        self.time.update();
        #[cfg(feature = "profiling")]
        let _tick_span = info_span!("world.tick", frame = self.time.frame_count()).entered();

        for at in 0..self.systems.len() {
            if self.systems[at].entered {
                continue;
            }
            self.systems[at].entered = true;
            let mut ctx = SystemContext {
                manager: &mut self.manager,
                tasks: &self.tasks,
                time: &self.time,
                quit: &self.quit,
                buffers: &self.buffers,
                predecessor: TaskHandle::completed(),
            };
            self.systems[at].system.on_enter(&mut ctx);
            let predecessor = ctx.predecessor;
            self.sync(predecessor)?;
        }

        for at in 0..self.systems.len() {
            let mut ctx = SystemContext {
                manager: &mut self.manager,
                tasks: &self.tasks,
                time: &self.time,
                quit: &self.quit,
                buffers: &self.buffers,
                predecessor: TaskHandle::completed(),
            };
            self.systems[at].system.on_update(&mut ctx);
            let predecessor = ctx.predecessor;
            self.sync(predecessor)?;
        }

        self.manager.allocator().promote_quarantined();
        Ok(())
    }

    /// Tick until a system (or another thread) calls quit, then run the exit
    /// phase.
    pub fn run(&mut self) -> Result<()> {
        while !self.should_quit() {
            self.tick()?;
        }
        self.shutdown()
    }

    /// Run `on_exit` for every entered system and drain what they deferred.
    pub fn shutdown(&mut self) -> Result<()> {
        for at in 0..self.systems.len() {
            if !self.systems[at].entered {
                continue;
            }
            let mut ctx = SystemContext {
                manager: &mut self.manager,
                tasks: &self.tasks,
                time: &self.time,
                quit: &self.quit,
                buffers: &self.buffers,
                predecessor: TaskHandle::completed(),
            };
            self.systems[at].system.on_exit(&mut ctx);
            let predecessor = ctx.predecessor;
            self.sync(predecessor)?;
        }
        Ok(())
    }

    /// Wait for the phase's tasks, then replay the deferred commands.
    ///
    /// Buffers are drained even when a task panicked, so the structural
    /// invariants hold before the failure is surfaced.
    fn sync(&mut self, predecessor: TaskHandle) -> Result<()> {
        let waited = predecessor.wait();
        let report = self
            .manager
            .drain_command_buffers(&self.buffers, self.config.drain_policy);
        waited?;
        if self.config.drain_policy == DrainPolicy::Abort {
            if let Some(error) = report.errors.into_iter().next() {
                return Err(error);
            }
        }
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
