//! Subscriber handler types.

use crate::types::Publication;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Error returned by a subscriber handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one publication.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Receives publications routed to a registered subscriber.
///
/// Errors and panics raised here are logged by the delivery strategy and
/// never reach the publisher or other subscribers.
pub trait Subscriber: Send + Sync {
    fn on_publication(&self, publication: &Publication) -> HandlerResult;
}

/// Adapter turning a closure into a [`Subscriber`].
pub struct FnSubscriber<F>(F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&Publication) -> HandlerResult + Send + Sync,
{
    fn on_publication(&self, publication: &Publication) -> HandlerResult {
        (self.0)(publication)
    }
}

/// Wrap a closure as a shareable subscriber handler.
pub fn handler<F>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(&Publication) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(FnSubscriber(f))
}

/// How publications reach a single subscriber's handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Run the handler on the thread that dispatches the publication.
    #[default]
    Inline,
    /// One thread owned for the registration's lifetime.
    DedicatedThread,
    /// Bounded queue with a worker spawned only while it has a backlog.
    OnDemand,
    /// Bounded queue consumed by one long-lived worker.
    PersistentQueue,
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryKind::Inline => "inline",
            DeliveryKind::DedicatedThread => "dedicated_thread",
            DeliveryKind::OnDemand => "on_demand",
            DeliveryKind::PersistentQueue => "persistent_queue",
        };
        f.write_str(name)
    }
}

/// Delivery counters shared by every strategy of one broker.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    refused: AtomicU64,
}

impl DeliveryCounters {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler invocations that returned `Ok`.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Handler invocations that returned an error or panicked.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliveries dropped because the strategy was already closed.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}
