//! Per-subscriber delivery strategies.
//!
//! Every registration owns exactly one [`Delivery`]. The strategy decides on
//! which thread the handler runs and what ordering the subscriber observes:
//!
//! | kind | thread | ordering |
//! |---|---|---|
//! | `Inline` | caller | whatever order the caller delivers in |
//! | `DedicatedThread` | one owned worker | FIFO |
//! | `OnDemand` | spawned while backlogged | FIFO |
//! | `PersistentQueue` | one owned worker | FIFO |
//!
//! Closing a strategy refuses new deliveries and flushes accepted ones: the
//! worker drains its queue before exiting and `close` waits for it.

use crate::error::Result;
use crate::mailbox::{Mailbox, WorkerMode};
use crate::tasks::{panic_message, TaskExecutor};
use crate::types::Publication;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

use super::types::{DeliveryCounters, DeliveryKind, Subscriber};

thread_local! {
    /// Handler invocations running on this thread.
    static HANDLER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is inside a subscriber handler.
pub(crate) fn in_handler() -> bool {
    HANDLER_DEPTH.with(|depth| depth.get() > 0)
}

struct HandlerScope;

impl HandlerScope {
    fn enter() -> Self {
        HANDLER_DEPTH.with(|depth| depth.set(depth.get() + 1));
        HandlerScope
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        HANDLER_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Runs a subscriber's handler, isolating its failures.
#[derive(Clone)]
struct Invoker {
    subscriber: Arc<str>,
    handler: Arc<dyn Subscriber>,
    counters: Arc<DeliveryCounters>,
}

impl Invoker {
    fn invoke(&self, publication: &Publication) {
        let outcome = {
            let _scope = HandlerScope::enter();
            panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_publication(publication)))
        };

        match outcome {
            Ok(Ok(())) => {
                self.counters.record_delivered();
                trace!(subscriber = %self.subscriber, id = %publication.id, "delivered");
            }
            Ok(Err(e)) => {
                self.counters.record_failed();
                warn!(
                    subscriber = %self.subscriber,
                    topic = %publication.topic,
                    error = %e,
                    "subscriber handler failed"
                );
            }
            Err(panic) => {
                self.counters.record_failed();
                error!(
                    subscriber = %self.subscriber,
                    topic = %publication.topic,
                    reason = panic_message(&*panic),
                    "subscriber handler panicked"
                );
            }
        }
    }
}

enum Strategy {
    Inline { closed: AtomicBool },
    DedicatedThread(TaskExecutor),
    OnDemand(Mailbox<Arc<Publication>>),
    PersistentQueue(Mailbox<Arc<Publication>>),
}

/// A subscriber's bound delivery strategy.
pub struct Delivery {
    kind: DeliveryKind,
    invoker: Invoker,
    strategy: Strategy,
}

impl Delivery {
    /// Build the strategy, starting its worker for thread-backed kinds.
    ///
    /// `capacity` bounds the queue of the thread-backed kinds.
    pub fn start(
        subscriber: &str,
        handler: Arc<dyn Subscriber>,
        kind: DeliveryKind,
        capacity: usize,
        counters: Arc<DeliveryCounters>,
    ) -> Result<Self> {
        let invoker = Invoker {
            subscriber: Arc::from(subscriber),
            handler,
            counters,
        };
        let worker_name = format!("sub-{}", subscriber);

        let strategy = match kind {
            DeliveryKind::Inline => Strategy::Inline {
                closed: AtomicBool::new(false),
            },
            DeliveryKind::DedicatedThread => {
                Strategy::DedicatedThread(TaskExecutor::start(worker_name, 1, capacity)?)
            }
            DeliveryKind::OnDemand => {
                let invoker = invoker.clone();
                Strategy::OnDemand(Mailbox::start(
                    worker_name,
                    WorkerMode::OnDemand,
                    capacity,
                    move |publication: Arc<Publication>| invoker.invoke(&publication),
                )?)
            }
            DeliveryKind::PersistentQueue => {
                let invoker = invoker.clone();
                Strategy::PersistentQueue(Mailbox::start(
                    worker_name,
                    WorkerMode::Persistent,
                    capacity,
                    move |publication: Arc<Publication>| invoker.invoke(&publication),
                )?)
            }
        };

        Ok(Self {
            kind,
            invoker,
            strategy,
        })
    }

    pub fn kind(&self) -> DeliveryKind {
        self.kind
    }

    pub fn subscriber(&self) -> &str {
        &self.invoker.subscriber
    }

    /// Hand one publication to the subscriber.
    ///
    /// Returns false if the strategy is closed and the publication was dropped.
    pub fn deliver(&self, publication: Arc<Publication>) -> bool {
        let accepted = match &self.strategy {
            Strategy::Inline { closed } => {
                if closed.load(Ordering::Acquire) {
                    false
                } else {
                    self.invoker.invoke(&publication);
                    true
                }
            }
            Strategy::DedicatedThread(executor) => {
                let invoker = self.invoker.clone();
                let name = format!("deliver:{}:{}", self.invoker.subscriber, publication.id);
                executor.submit(move || invoker.invoke(&publication), name)
            }
            Strategy::OnDemand(mailbox) | Strategy::PersistentQueue(mailbox) => {
                mailbox.send(publication)
            }
        };

        if !accepted {
            self.invoker.counters.record_refused();
            trace!(subscriber = %self.invoker.subscriber, "delivery refused after close");
        }
        accepted
    }

    /// Deliveries accepted but not yet picked up by a worker.
    pub fn backlog(&self) -> usize {
        match &self.strategy {
            Strategy::OnDemand(mailbox) | Strategy::PersistentQueue(mailbox) => mailbox.len(),
            Strategy::Inline { .. } | Strategy::DedicatedThread(_) => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.strategy {
            Strategy::Inline { closed } => closed.load(Ordering::Acquire),
            Strategy::DedicatedThread(executor) => executor.is_shut_down(),
            Strategy::OnDemand(mailbox) | Strategy::PersistentQueue(mailbox) => mailbox.is_closed(),
        }
    }

    /// Refuse further deliveries without waiting for accepted ones.
    ///
    /// A deliver call blocked on a full queue gives up. Idempotent.
    pub fn interrupt(&self) {
        match &self.strategy {
            Strategy::Inline { closed } => closed.store(true, Ordering::Release),
            Strategy::DedicatedThread(executor) => executor.interrupt(),
            Strategy::OnDemand(mailbox) | Strategy::PersistentQueue(mailbox) => {
                mailbox.interrupt()
            }
        }
    }

    /// Refuse further deliveries and flush the accepted ones. Idempotent.
    pub fn close(&self) {
        match &self.strategy {
            Strategy::Inline { closed } => closed.store(true, Ordering::Release),
            Strategy::DedicatedThread(executor) => executor.shutdown(),
            Strategy::OnDemand(mailbox) | Strategy::PersistentQueue(mailbox) => mailbox.close(),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subscriber", &self.invoker.subscriber)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::handler;
    use crate::topic::Topic;
    use crate::types::{PublicationId, Timestamp};
    use serde_json::json;
    use std::time::Duration;

    const ALL_KINDS: [DeliveryKind; 4] = [
        DeliveryKind::Inline,
        DeliveryKind::DedicatedThread,
        DeliveryKind::OnDemand,
        DeliveryKind::PersistentQueue,
    ];

    fn make_publication(id: u64) -> Arc<Publication> {
        Arc::new(Publication {
            id: PublicationId(id),
            broker: "test".into(),
            topic: Topic::parse("t/x"),
            timestamp: Timestamp::now(),
            payload: vec![json!(id)],
            keep: None,
        })
    }

    fn recording(kind: DeliveryKind) -> (Delivery, crossbeam_channel::Receiver<u64>, Arc<DeliveryCounters>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let counters = Arc::new(DeliveryCounters::default());
        let delivery = Delivery::start(
            "recorder",
            handler(move |p| {
                tx.send(p.id.0)?;
                Ok(())
            }),
            kind,
            8,
            Arc::clone(&counters),
        )
        .unwrap();
        (delivery, rx, counters)
    }

    #[test]
    fn test_every_kind_preserves_order() {
        for kind in ALL_KINDS {
            let (delivery, rx, counters) = recording(kind);
            for id in 0..40 {
                assert!(delivery.deliver(make_publication(id)), "{kind} refused");
            }
            delivery.close();

            let received: Vec<u64> = rx.try_iter().collect();
            assert_eq!(received, (0..40).collect::<Vec<_>>(), "{kind} reordered");
            assert_eq!(counters.delivered(), 40);
        }
    }

    #[test]
    fn test_close_refuses_new_deliveries() {
        for kind in ALL_KINDS {
            let (delivery, rx, counters) = recording(kind);
            delivery.close();
            delivery.close();

            assert!(delivery.is_closed());
            assert!(!delivery.deliver(make_publication(1)));
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
            assert_eq!(counters.refused(), 1);
        }
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        for kind in ALL_KINDS {
            let counters = Arc::new(DeliveryCounters::default());
            let (tx, rx) = crossbeam_channel::unbounded();
            let delivery = Delivery::start(
                "flaky",
                handler(move |p| {
                    match p.id.0 {
                        0 => return Err("rejected".into()),
                        1 => panic!("handler bug"),
                        _ => {}
                    }
                    tx.send(p.id.0)?;
                    Ok(())
                }),
                kind,
                4,
                Arc::clone(&counters),
            )
            .unwrap();

            for id in 0..3 {
                assert!(delivery.deliver(make_publication(id)));
            }
            delivery.close();

            assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2]);
            assert_eq!(counters.failed(), 2);
            assert_eq!(counters.delivered(), 1);
        }
    }

    #[test]
    fn test_handler_scope_is_tracked() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let delivery = Delivery::start(
            "scoped",
            handler(move |_| {
                tx.send(in_handler())?;
                Ok(())
            }),
            DeliveryKind::Inline,
            1,
            Arc::new(DeliveryCounters::default()),
        )
        .unwrap();

        assert!(!in_handler());
        delivery.deliver(make_publication(0));
        assert!(rx.try_recv().unwrap());
        assert!(!in_handler());
    }

    #[test]
    fn test_threaded_kinds_do_not_run_on_caller() {
        for kind in [DeliveryKind::DedicatedThread, DeliveryKind::OnDemand, DeliveryKind::PersistentQueue] {
            let caller = std::thread::current().id();
            let (tx, rx) = crossbeam_channel::unbounded();
            let delivery = Delivery::start(
                "threaded",
                handler(move |_| {
                    tx.send(std::thread::current().id())?;
                    Ok(())
                }),
                kind,
                4,
                Arc::new(DeliveryCounters::default()),
            )
            .unwrap();

            delivery.deliver(make_publication(0));
            let worker = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_ne!(worker, caller);
            assert_eq!(delivery.kind(), kind);
        }
    }
}
