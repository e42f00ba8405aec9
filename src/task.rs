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

//! DAG task scheduler over a fixed pool of worker threads.
//!
//! Tasks are nodes with an atomic predecessor count; a node whose count hits
//! zero is pushed onto the shared ready queue. Predecessor edges are
//! happen-before: the node-state mutex and the channel publish every write of
//! a predecessor to its successors. Cancellation is not supported; a panic
//! poisons the node and propagates through successors, surfacing at `wait`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{EcsError, Result};

type TaskFn = Box<dyn FnOnce(usize) + Send>;

enum WorkerMessage {
    Run(Arc<TaskNode>),
    Stop,
}

struct NodeState {
    payload: Option<TaskFn>,
    successors: Vec<Arc<TaskNode>>,
    finished: bool,
    poison: Option<String>,
}

struct TaskNode {
    join: bool,
    pending: AtomicUsize,
    state: Mutex<NodeState>,
    finished_signal: Condvar,
}

enum EdgeOutcome {
    Registered,
    AlreadyFinished,
    AlreadyPoisoned(String),
}

impl TaskNode {
    fn new(payload: Option<TaskFn>, join: bool) -> Arc<Self> {
        Arc::new(Self {
            join,
            // Creation guard: the node cannot become ready while its edges
            // are still being registered.
            pending: AtomicUsize::new(1),
            state: Mutex::new(NodeState {
                payload,
                successors: Vec::new(),
                finished: false,
                poison: None,
            }),
            finished_signal: Condvar::new(),
        })
    }

    fn completed() -> Arc<Self> {
        let node = Self::new(None, true);
        node.state.lock().finished = true;
        node
    }

    fn add_successor(&self, successor: &Arc<TaskNode>) -> EdgeOutcome {
        let mut state = self.state.lock();
        if state.finished {
            match &state.poison {
                Some(message) => EdgeOutcome::AlreadyPoisoned(message.clone()),
                None => EdgeOutcome::AlreadyFinished,
            }
        } else {
            state.successors.push(successor.clone());
            EdgeOutcome::Registered
        }
    }

    fn poison(&self, message: &str) {
        let mut state = self.state.lock();
        if state.poison.is_none() {
            state.poison = Some(message.to_string());
        }
    }

    /// Drop one pending predecessor; the node becomes runnable at zero.
    fn resolve(node: &Arc<TaskNode>, sender: &Sender<WorkerMessage>) {
        if node.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if node.join {
            // Join nodes carry no work; complete on whichever thread
            // released the last edge.
            node.finish(None, sender);
        } else {
            sender
                .send(WorkerMessage::Run(node.clone()))
                .expect("ready queue closed while scheduling");
        }
    }

    fn finish(&self, panic_message: Option<String>, sender: &Sender<WorkerMessage>) {
        let (successors, poison) = {
            let mut state = self.state.lock();
            if let Some(message) = panic_message {
                if state.poison.is_none() {
                    state.poison = Some(message);
                }
            }
            state.finished = true;
            (std::mem::take(&mut state.successors), state.poison.clone())
        };
        self.finished_signal.notify_all();
        for successor in successors {
            if let Some(message) = &poison {
                successor.poison(message);
            }
            TaskNode::resolve(&successor, sender);
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while !state.finished {
            self.finished_signal.wait(&mut state);
        }
        match &state.poison {
            Some(message) => Err(EcsError::TaskPanicked(message.clone())),
            None => Ok(()),
        }
    }
}

/// Handle to a node in the scheduler DAG; a task or a join.
#[derive(Clone)]
pub struct TaskHandle(Arc<TaskNode>);

impl TaskHandle {
    /// A handle that is already finished; the identity predecessor.
    pub fn completed() -> Self {
        TaskHandle(TaskNode::completed())
    }

    /// Park the caller until the node finishes. Surfaces the first panic of
    /// the node or any transitive predecessor.
    pub fn wait(&self) -> Result<()> {
        self.0.wait()
    }

    pub fn is_finished(&self) -> bool {
        self.0.state.lock().finished
    }
}

/// One pool thread pulling from the ready queue.
struct TaskWorker {
    id: usize,
    receiver: Receiver<WorkerMessage>,
    sender: Sender<WorkerMessage>,
}

impl TaskWorker {
    fn run(self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                WorkerMessage::Run(node) => self.execute(node),
                WorkerMessage::Stop => break,
            }
        }
    }

    fn execute(&self, node: Arc<TaskNode>) {
        let payload = {
            let mut state = node.state.lock();
            // A poisoned node skips its work but still completes, so peers
            // keep running and joins are released.
            if state.poison.is_some() {
                None
            } else {
                state.payload.take()
            }
        };
        let mut panic_message = None;
        if let Some(task) = payload {
            let worker_id = self.id;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(worker_id))) {
                let message = panic_payload_message(&*payload);
                trace!(worker = self.id, panic = %message, "task panicked");
                panic_message = Some(message);
            }
        }
        node.finish(panic_message, &self.sender);
    }
}

fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Fixed-size worker pool executing an explicit task DAG.
pub struct TaskManager {
    sender: Sender<WorkerMessage>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl TaskManager {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded();
        let workers = (0..worker_count)
            .map(|id| {
                let worker = TaskWorker {
                    id,
                    receiver: receiver.clone(),
                    sender: sender.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("task-worker-{id}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn task worker")
            })
            .collect();
        trace!(worker_count, "task manager started");
        Self {
            sender,
            workers,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Schedule a task that runs after every predecessor has finished. The
    /// closure receives the executing worker's id.
    pub fn schedule<F>(&self, task: F, predecessors: &[TaskHandle]) -> TaskHandle
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.schedule_node(Some(Box::new(task)), false, predecessors)
    }

    /// A join node that completes when all predecessors have completed.
    pub fn combine(&self, predecessors: &[TaskHandle]) -> TaskHandle {
        self.schedule_node(None, true, predecessors)
    }

    fn schedule_node(
        &self,
        payload: Option<TaskFn>,
        join: bool,
        predecessors: &[TaskHandle],
    ) -> TaskHandle {
        let node = TaskNode::new(payload, join);
        for predecessor in predecessors {
            match predecessor.0.add_successor(&node) {
                EdgeOutcome::Registered => {
                    node.pending.fetch_add(1, Ordering::AcqRel);
                }
                EdgeOutcome::AlreadyFinished => {}
                EdgeOutcome::AlreadyPoisoned(message) => node.poison(&message),
            }
        }
        // Release the creation guard; the node may become runnable here.
        TaskNode::resolve(&node, &self.sender);
        TaskHandle(node)
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        for _ in 0..self.worker_count {
            let _ = self.sender.send(WorkerMessage::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
