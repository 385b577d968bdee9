//! Named-task execution.
//!
//! A [`TaskExecutor`] is a fixed pool of worker threads fed by one bounded
//! queue. Every task carries a name that shows up in logs when the task
//! panics. With a single worker, tasks run strictly in submission order.

use crate::error::Result;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct NamedTask {
    name: String,
    job: Job,
}

/// Fixed-size pool running named tasks.
pub struct TaskExecutor {
    name: String,
    /// `None` once shut down.
    sender: RwLock<Option<Sender<NamedTask>>>,
    /// Dropped on shutdown to wake submitters blocked on a full queue.
    closing: Mutex<Option<Sender<()>>>,
    closed_signal: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    /// Start `workers` threads sharing a queue of `capacity` pending tasks.
    pub fn start(name: impl Into<String>, workers: usize, capacity: usize) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = bounded::<NamedTask>(capacity.max(1));
        let (closing, closed_signal) = bounded(0);

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    for task in receiver.iter() {
                        run_task(task);
                    }
                })?;
            handles.push(handle);
        }

        debug!(name = %name, workers = handles.len(), "task executor started");

        Ok(Self {
            name,
            sender: RwLock::new(Some(sender)),
            closing: Mutex::new(Some(closing)),
            closed_signal,
            workers: Mutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queue a task, blocking while the queue is full.
    ///
    /// Returns false if the executor has been shut down, or is shut down
    /// while this call is blocked.
    pub fn submit<F>(&self, task: F, name: impl Into<String>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return false;
        };

        let task = NamedTask {
            name: name.into(),
            job: Box::new(task),
        };
        select! {
            send(sender, task) -> res => res.is_ok(),
            recv(self.closed_signal) -> _ => false,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Stop intake without waiting for queued tasks.
    ///
    /// Submitters blocked on a full queue give up. Idempotent.
    pub fn interrupt(&self) {
        self.stop_intake();
    }

    fn stop_intake(&self) -> bool {
        drop(self.closing.lock().take());
        self.sender.write().take().is_some()
    }

    /// Stop intake, run the queued tasks and join the workers.
    ///
    /// Idempotent. A worker calling this on its own pool is not joined.
    pub fn shutdown(&self) {
        let was_open = self.stop_intake();

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(name = %self.name, "task worker panicked");
            }
        }
        if was_open {
            debug!(name = %self.name, "task executor shut down");
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(task: NamedTask) {
    let NamedTask { name, job } = task;
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(task = %name, reason = panic_message(&*panic), "task panicked");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
