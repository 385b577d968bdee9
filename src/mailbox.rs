//! Bounded single-consumer FIFO worker.
//!
//! A mailbox owns a bounded `crossbeam_channel` and exactly one consumer
//! thread at a time. Two worker modes are available:
//!
//! - [`WorkerMode::Persistent`]: one long-lived thread, started eagerly and
//!   kept until the mailbox is closed.
//! - [`WorkerMode::OnDemand`]: a thread is spawned when an item arrives at an
//!   idle mailbox and exits as soon as the queue is drained.
//!
//! `send` blocks while the queue is full, which is the backpressure point for
//! callers. Closing stops intake, wakes senders still blocked on a full queue
//! (their items are refused) and lets the worker drain everything that was
//! already accepted before it exits.

use crate::error::Result;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// How the consumer thread is managed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    /// One thread for the mailbox's whole lifetime.
    Persistent,
    /// A thread only while the queue is non-empty.
    OnDemand,
}

type Consumer<T> = Arc<dyn Fn(T) + Send + Sync>;

/// State shared with the worker thread.
struct Shared<T> {
    name: String,
    receiver: Receiver<T>,
    consumer: Consumer<T>,
    /// Set while an on-demand worker owns the receiver.
    active: AtomicBool,
}

/// Bounded FIFO queue with a single consumer thread.
pub struct Mailbox<T: Send + 'static> {
    mode: WorkerMode,
    capacity: usize,
    /// `None` once closed.
    sender: RwLock<Option<Sender<T>>>,
    /// Dropped on close; disconnects `closed_signal`.
    closing: Mutex<Option<Sender<()>>>,
    closed_signal: Receiver<()>,
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Mailbox<T> {
    /// Create a mailbox. Persistent mailboxes start their thread here.
    pub fn start<F>(name: impl Into<String>, mode: WorkerMode, capacity: usize, consumer: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (closing, closed_signal) = bounded(0);
        let shared = Arc::new(Shared {
            name: name.into(),
            receiver,
            consumer: Arc::new(consumer),
            active: AtomicBool::new(false),
        });

        let worker = match mode {
            WorkerMode::Persistent => {
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(shared.name.clone())
                    .spawn(move || run_persistent(shared))?;
                Some(handle)
            }
            WorkerMode::OnDemand => None,
        };

        debug!(name = %shared.name, ?mode, capacity, "mailbox started");

        Ok(Self {
            mode,
            capacity,
            sender: RwLock::new(Some(sender)),
            closing: Mutex::new(Some(closing)),
            closed_signal,
            shared,
            worker: Mutex::new(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items not yet taken by the worker.
    pub fn len(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.receiver.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Enqueue an item, blocking while the queue is full.
    ///
    /// Returns false if the mailbox is closed, or gets closed while this call
    /// is blocked; the item is dropped.
    pub fn send(&self, item: T) -> bool {
        // Held until the worker is ensured so `close` never misses it.
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return false;
        };

        let sent = select! {
            send(sender, item) -> res => res.is_ok(),
            recv(self.closed_signal) -> _ => false,
        };

        if sent && self.mode == WorkerMode::OnDemand {
            self.ensure_worker();
        }
        sent
    }

    /// Spawn an on-demand worker unless one already owns the queue.
    fn ensure_worker(&self) {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_on_demand(shared));

        match spawned {
            Ok(handle) => {
                // A replaced handle belongs to a worker that already gave up
                // the queue; dropping it detaches that thread.
                *self.worker.lock() = Some(handle);
            }
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                error!(name = %self.shared.name, error = %e, "failed to spawn mailbox worker");
            }
        }
    }

    /// Stop intake without waiting for the worker.
    ///
    /// Senders blocked on a full queue give up. Idempotent.
    pub fn interrupt(&self) {
        self.stop_intake();
    }

    /// Returns whether intake was still open.
    fn stop_intake(&self) -> bool {
        // Wake blocked senders first; they hold the read lock.
        drop(self.closing.lock().take());
        self.sender.write().take().is_some()
    }

    /// Stop intake and wait for the worker to drain accepted items.
    ///
    /// Idempotent. When called from the worker thread itself the worker is
    /// detached instead of joined and still drains the queue.
    pub fn close(&self) {
        let was_open = self.stop_intake();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!(name = %self.shared.name, "mailbox closed from its own worker");
                return;
            }
            if handle.join().is_err() {
                error!(name = %self.shared.name, "mailbox worker panicked");
            }
        }
        if was_open {
            debug!(name = %self.shared.name, "mailbox closed");
        }
    }
}

impl<T: Send + 'static> Drop for Mailbox<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_persistent<T>(shared: Arc<Shared<T>>) {
    // Ends once every sender is gone and the queue is empty.
    for item in shared.receiver.iter() {
        (shared.consumer)(item);
    }
    debug!(name = %shared.name, "persistent worker exiting");
}

fn run_on_demand<T>(shared: Arc<Shared<T>>) {
    loop {
        while let Ok(item) = shared.receiver.try_recv() {
            (shared.consumer)(item);
        }

        shared.active.store(false, Ordering::SeqCst);

        // An item may have landed after the drain but before `active` was
        // cleared; its sender saw us active and did not spawn a worker.
        if shared.receiver.is_empty() || shared.active.swap(true, Ordering::SeqCst) {
            break;
        }
    }
}
