//! Read worker threads
//!
//! A worker is a long-lived thread bound to one queue index. It blocks on its
//! queue until a [`SubTask`] arrives, performs that task's positioned read
//! through the shared [`ReadEngine`], and reports the outcome to the
//! completion tracker. It never retries: short reads and errors are reported
//! as they are and the dispatcher decides what they mean.
//!
//! # Lifecycle
//!
//! 1. **Creation**: the dispatcher builds one `Worker` per queue
//! 2. **Execution**: `run()` drains the queue until every sender is gone
//! 3. **Shutdown**: tasks still queued at shutdown are drained, not dropped;
//!    tasks of cancelled generations are skipped without touching the file
//!
//! # Thread Safety
//!
//! The queue is a bounded crossbeam channel with the dispatcher as the only
//! producer and this worker as the only consumer, so no lock is shared
//! between workers.

pub mod affinity;

use crate::dispatch::task::SubTask;
use crate::dispatch::SubTaskStatus;
use crate::engine::ReadEngine;
use crate::stats::DispatchStats;
use crate::Result;
use anyhow::Context;
use crossbeam::channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Worker thread that executes sub-reads
pub struct Worker {
    /// Queue index, also the sub-task index this worker serves
    id: usize,

    /// Pending sub-tasks, fed by the dispatcher
    queue: Receiver<SubTask>,

    /// Shared positioned-read backend
    engine: Arc<dyn ReadEngine>,

    /// Dispatcher-wide counters
    stats: Arc<DispatchStats>,

    /// Core to pin this thread to, if any
    cpu_core: Option<usize>,
}

impl Worker {
    /// Create a worker for queue `id`
    pub(crate) fn new(
        id: usize,
        queue: Receiver<SubTask>,
        engine: Arc<dyn ReadEngine>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            id,
            queue,
            engine,
            stats,
            cpu_core: None,
        }
    }

    /// Pin the worker thread to `core` once it starts
    pub(crate) fn with_cpu_core(mut self, core: Option<usize>) -> Self {
        self.cpu_core = core;
        self
    }

    /// Start the worker on its own named thread
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        let name = format!("fanread-worker-{}", self.id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .context("Failed to spawn read worker thread")
    }

    /// Main loop
    ///
    /// Returns once the queue is closed and empty.
    pub(crate) fn run(self) {
        self.apply_affinity();
        tracing::debug!(worker = self.id, engine = self.engine.name(), "worker started");

        // Blocks while the queue is empty; ends when all senders are dropped
        for task in self.queue.iter() {
            let generation = task.generation();
            let index = task.index();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(task)));
            if outcome.is_err() {
                // The task reported an EIO failure while unwinding
                tracing::error!(
                    worker = self.id,
                    %generation,
                    index,
                    "sub-read panicked; worker continues"
                );
                self.stats.sub_task_errors.add(1);
            }
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// Run one sub-task and report it
    fn execute(&self, mut task: SubTask) {
        if task.is_cancelled() {
            self.stats.sub_tasks_skipped.add(1);
            task.finish(SubTaskStatus::Cancelled);
            return;
        }

        self.stats.sub_tasks.add(1);
        if task.is_empty() {
            task.finish(SubTaskStatus::Complete(0));
            return;
        }

        let fd = task.fd();
        let offset = task.offset();
        let len = task.len();
        let result = self.engine.read_at(fd, task.destination(), offset);

        match &result {
            Ok(n) => {
                tracing::trace!(
                    worker = self.id,
                    generation = %task.generation(),
                    offset,
                    len,
                    read = *n,
                    "sub-read done"
                );
            }
            Err(e) => {
                tracing::warn!(
                    worker = self.id,
                    generation = %task.generation(),
                    fd,
                    offset,
                    len,
                    error = %e,
                    "sub-read failed"
                );
                self.stats.sub_task_errors.add(1);
            }
        }

        task.finish(SubTaskStatus::from_read(len, result));
    }

    fn apply_affinity(&self) {
        if let Some(core) = self.cpu_core {
            if let Err(e) = affinity::set_cpu_affinity(&[core]) {
                tracing::warn!(worker = self.id, core, error = %e, "running unpinned");
            }
        }
    }
}
