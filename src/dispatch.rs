//! Broker-wide dispatch variants.
//!
//! A dispatcher decides how one publish call fans out to the delivery
//! strategies of its matched subscribers. It never changes a subscriber's own
//! ordering, which belongs to that subscriber's [`Delivery`].
//!
//! [`Delivery`]: crate::subscribers::Delivery

use crate::cache::Matched;
use crate::error::Result;
use crate::mailbox::{Mailbox, WorkerMode};
use crate::tasks::TaskExecutor;
use crate::types::Publication;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// How a broker hands matched subscribers their publication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Deliver on the publishing thread, in priority order.
    #[default]
    Inline,
    /// Submit each fan-out as one task to a background pool.
    Detached,
    /// Queue fan-outs for a worker that exists only while there is a backlog.
    QueuedEphemeral,
    /// Queue fan-outs for one long-lived worker.
    QueuedPersistent,
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchKind::Inline => "inline",
            DispatchKind::Detached => "detached",
            DispatchKind::QueuedEphemeral => "queued_ephemeral",
            DispatchKind::QueuedPersistent => "queued_persistent",
        };
        f.write_str(name)
    }
}

/// One publication together with the subscribers it goes to.
pub struct DispatchUnit {
    pub publication: Arc<Publication>,
    pub matched: Arc<[Matched]>,
}

impl DispatchUnit {
    /// Deliver to every matched subscriber, highest priority first.
    fn fan_out(&self) {
        for m in self.matched.iter() {
            m.delivery.deliver(Arc::clone(&self.publication));
        }
    }
}

/// The dispatch variant of one broker.
pub enum Dispatcher {
    Inline,
    Detached(TaskExecutor),
    Queued(Mailbox<DispatchUnit>),
}

impl Dispatcher {
    /// Start the variant. `workers` sizes the detached pool and `capacity`
    /// bounds the pending fan-outs of the background variants.
    pub fn start(broker: &str, kind: DispatchKind, workers: usize, capacity: usize) -> Result<Self> {
        let name = format!("broker-{}", broker);
        let dispatcher = match kind {
            DispatchKind::Inline => Dispatcher::Inline,
            DispatchKind::Detached => {
                Dispatcher::Detached(TaskExecutor::start(name, workers, capacity)?)
            }
            DispatchKind::QueuedEphemeral => Dispatcher::Queued(Mailbox::start(
                name,
                WorkerMode::OnDemand,
                capacity,
                |unit: DispatchUnit| unit.fan_out(),
            )?),
            DispatchKind::QueuedPersistent => Dispatcher::Queued(Mailbox::start(
                name,
                WorkerMode::Persistent,
                capacity,
                |unit: DispatchUnit| unit.fan_out(),
            )?),
        };
        Ok(dispatcher)
    }

    pub fn kind(&self) -> DispatchKind {
        match self {
            Dispatcher::Inline => DispatchKind::Inline,
            Dispatcher::Detached(_) => DispatchKind::Detached,
            Dispatcher::Queued(mailbox) => match mailbox.mode() {
                WorkerMode::OnDemand => DispatchKind::QueuedEphemeral,
                WorkerMode::Persistent => DispatchKind::QueuedPersistent,
            },
        }
    }

    /// Hand `publication` to its matched subscribers.
    ///
    /// Returns false if the dispatcher was shut down and nothing was sent.
    pub fn dispatch(&self, publication: Arc<Publication>, matched: Arc<[Matched]>) -> bool {
        if matched.is_empty() {
            return true;
        }

        let unit = DispatchUnit {
            publication,
            matched,
        };

        let accepted = match self {
            Dispatcher::Inline => {
                unit.fan_out();
                true
            }
            Dispatcher::Detached(executor) => {
                let name = format!("publish:{}:{}", unit.publication.broker, unit.publication.topic);
                executor.submit(move || unit.fan_out(), name)
            }
            Dispatcher::Queued(mailbox) => mailbox.send(unit),
        };

        if !accepted {
            warn!(kind = %self.kind(), "dispatcher shut down, publication dropped");
        }
        accepted
    }

    /// Fan-outs waiting for a background worker.
    pub fn backlog(&self) -> usize {
        match self {
            Dispatcher::Queued(mailbox) => mailbox.len(),
            Dispatcher::Inline | Dispatcher::Detached(_) => 0,
        }
    }

    /// Stop accepting fan-outs without waiting for pending ones.
    pub fn interrupt(&self) {
        match self {
            Dispatcher::Inline => {}
            Dispatcher::Detached(executor) => executor.interrupt(),
            Dispatcher::Queued(mailbox) => mailbox.interrupt(),
        }
    }

    /// Flush pending fan-outs and stop the workers. Idempotent.
    pub fn shutdown(&self) {
        match self {
            Dispatcher::Inline => {}
            Dispatcher::Detached(executor) => executor.shutdown(),
            Dispatcher::Queued(mailbox) => mailbox.close(),
        }
    }
}
