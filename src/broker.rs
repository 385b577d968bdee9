//! The named publish/subscribe broker.

use crate::cache::{CacheStats, MatchCache, Matched};
use crate::dispatch::{DispatchKind, Dispatcher};
use crate::error::{BrokerError, Result};
use crate::registry::BrokerMap;
use crate::retention::PublicationStore;
use crate::subscribers::{
    in_handler, Delivery, DeliveryCounters, DeliveryKind, Registration, Subscriber,
};
use crate::tasks::TaskExecutor;
use crate::topic::Topic;
use crate::types::{Payload, PendingPublication, Publication, PublicationId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// How a publish call fans out to matched subscribers.
    pub dispatch: DispatchKind,

    /// Pending fan-outs for the background dispatch kinds, and pending
    /// replay tasks.
    /// Default: 1024
    pub dispatch_queue_capacity: usize,

    /// Worker threads of the detached dispatch pool.
    /// Default: 4
    pub detached_workers: usize,

    /// Queue bound of each thread-backed subscriber strategy.
    /// Default: 256
    pub mailbox_capacity: usize,

    /// Distinct topics kept in the match cache.
    /// Default: 1024
    pub cache_capacity: usize,

    /// Worker threads replaying retained publications to new subscriptions.
    /// Default: 1
    pub replay_workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchKind::Inline,
            dispatch_queue_capacity: 1024,
            detached_workers: 4,
            mailbox_capacity: 256,
            cache_capacity: 1024,
            replay_workers: 1,
        }
    }
}

impl BrokerConfig {
    /// Default configuration with the given dispatch kind.
    pub fn with_dispatch(dispatch: DispatchKind) -> Self {
        Self {
            dispatch,
            ..Default::default()
        }
    }
}

/// Point-in-time broker statistics.
#[derive(Clone, Debug)]
pub struct BrokerStats {
    pub subscribers: usize,
    /// Publications routed to subscribers (queued ones count once released).
    pub published: u64,
    /// Publications currently held by global or per-topic pauses.
    pub queued: usize,
    /// Handler invocations that succeeded.
    pub delivered: u64,
    /// Handler invocations that failed or panicked.
    pub failed: u64,
    /// Deliveries dropped because the subscriber's strategy was closed.
    pub refused: u64,
    /// Live retained publications.
    pub retained: usize,
    /// Fan-outs waiting for the dispatch worker.
    pub dispatch_backlog: usize,
    /// Deliveries waiting in subscriber queues.
    pub delivery_backlog: usize,
    pub cache: CacheStats,
}

/// State guarded by the broker's mutation lock.
struct BrokerState {
    subscribers: HashMap<String, Registration>,
    cache: MatchCache,
    running: bool,
    /// A resume is handing parked requests to the dispatcher; new requests
    /// park behind them until it is done.
    draining: bool,
    /// Requests parked by the global pause or waiting behind a drain.
    paused: VecDeque<PendingPublication>,
    /// Requests parked by per-topic pauses, keyed by literal topic.
    topic_queues: HashMap<String, VecDeque<PendingPublication>>,
    next_id: PublicationId,
    next_order: u64,
    closed: bool,
}

impl BrokerState {
    fn queued(&self) -> usize {
        self.paused.len() + self.topic_queues.values().map(VecDeque::len).sum::<usize>()
    }

    fn registration_mut(&mut self, id: &str) -> Result<&mut Registration> {
        self.subscribers
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownSubscriber(id.to_string()))
    }
}

/// Lifecycle of the lazily started replay executor.
enum ReplaySlot {
    Idle,
    Running(Arc<TaskExecutor>),
    Closed,
}

/// A fan-out decided under the lock and performed after it is released.
type Routed = (Arc<Publication>, Arc<[Matched]>);

/// A named publish/subscribe broker.
///
/// All mutations and every routing decision are serialized by one lock.
/// Handlers always run without that lock held, so they may call back into
/// the broker.
pub struct Broker {
    name: String,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    store: PublicationStore,
    dispatcher: Dispatcher,
    replay: Mutex<ReplaySlot>,
    counters: Arc<DeliveryCounters>,
    published: AtomicU64,
    /// Registry the broker was created by, if any.
    registry: Option<Weak<BrokerMap>>,
}

impl Broker {
    /// Create a standalone broker.
    pub fn new(name: impl Into<String>, config: BrokerConfig) -> Result<Self> {
        Self::build(name.into(), config, None)
    }

    pub(crate) fn build(
        name: String,
        config: BrokerConfig,
        registry: Option<Weak<BrokerMap>>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::start(
            &name,
            config.dispatch,
            config.detached_workers,
            config.dispatch_queue_capacity,
        )?;

        info!(broker = %name, dispatch = %config.dispatch, "broker created");

        Ok(Self {
            state: Mutex::new(BrokerState {
                subscribers: HashMap::new(),
                cache: MatchCache::new(config.cache_capacity),
                running: true,
                draining: false,
                paused: VecDeque::new(),
                topic_queues: HashMap::new(),
                next_id: PublicationId(1),
                next_order: 0,
                closed: false,
            }),
            name,
            config,
            store: PublicationStore::new(),
            dispatcher,
            replay: Mutex::new(ReplaySlot::Idle),
            counters: Arc::new(DeliveryCounters::default()),
            published: AtomicU64::new(0),
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn dispatch_kind(&self) -> DispatchKind {
        self.dispatcher.kind()
    }

    // --- Subscribers ---

    /// Register a subscriber under a unique id.
    ///
    /// Starts the worker of thread-backed delivery kinds. The subscriber has
    /// no patterns until [`subscribe`](Self::subscribe) is called.
    pub fn register_subscriber(
        &self,
        id: &str,
        handler: Arc<dyn Subscriber>,
        kind: DeliveryKind,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        if state.subscribers.contains_key(id) {
            return Err(BrokerError::DuplicateSubscriber(id.to_string()));
        }

        let delivery = Delivery::start(
            id,
            handler,
            kind,
            self.config.mailbox_capacity,
            Arc::clone(&self.counters),
        )?;

        let order = state.next_order;
        state.next_order += 1;
        state
            .subscribers
            .insert(id.to_string(), Registration::new(id, order, delivery));
        state.cache.invalidate();

        debug!(broker = %self.name, subscriber = id, %kind, "subscriber registered");
        Ok(())
    }

    /// Bind `patterns` to a subscriber at `priority`.
    ///
    /// Retained publications matching the newly bound patterns are replayed
    /// to the subscriber in the background, oldest first.
    pub fn subscribe(&self, id: &str, priority: i32, patterns: &[&str]) -> Result<()> {
        let (delivery, backlog) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }

            let registration = state.registration_mut(id)?;
            let added = registration.bind(priority, patterns.iter().map(|p| Topic::parse(*p)));
            let delivery = Arc::clone(registration.delivery());
            state.cache.invalidate();

            // Read under the lock: publications are retained while routing,
            // so each one is either delivered live or found here.
            let backlog = if added.is_empty() {
                Vec::new()
            } else {
                self.store.query(&added)
            };
            (delivery, backlog)
        };

        debug!(broker = %self.name, subscriber = id, priority, ?patterns, "subscribed");

        if !backlog.is_empty() {
            self.replay(id, delivery, backlog);
        }
        Ok(())
    }

    /// Remove the given pattern bindings from a subscriber.
    pub fn unsubscribe(&self, id: &str, patterns: &[&str]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }

        let topics: Vec<Topic> = patterns.iter().map(|p| Topic::parse(*p)).collect();
        let removed = state.registration_mut(id)?.unbind(&topics);
        state.cache.invalidate();

        debug!(broker = %self.name, subscriber = id, removed, "unsubscribed");
        Ok(())
    }

    /// Remove every pattern binding of a subscriber.
    pub fn unsubscribe_all(&self, id: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }

        let removed = state.registration_mut(id)?.unbind_all();
        state.cache.invalidate();

        debug!(broker = %self.name, subscriber = id, removed, "unsubscribed from all");
        Ok(())
    }

    /// Remove a subscriber and release its delivery strategy.
    ///
    /// Deliveries it already accepted are flushed; nothing further reaches it.
    pub fn unregister_subscriber(&self, id: &str) -> Result<()> {
        let registration = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }
            let registration = state
                .subscribers
                .remove(id)
                .ok_or_else(|| BrokerError::UnknownSubscriber(id.to_string()))?;
            state.cache.invalidate();
            registration
        };

        // Closing may wait for the worker to drain, which can call back
        // into the broker.
        registration.delivery().close();
        debug!(broker = %self.name, subscriber = id, "subscriber unregistered");
        Ok(())
    }

    // --- Publishing ---

    /// Publish without retention.
    pub fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        self.publish_retained(topic, payload, Duration::ZERO)
    }

    /// Publish and retain the publication for `keep` so later subscribers
    /// can have it replayed.
    pub fn publish_retained(&self, topic: &str, payload: Payload, keep: Duration) -> Result<()> {
        let pending = PendingPublication::new(Topic::parse(topic), payload, keep);
        let routed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }
            if Instant::now().checked_add(keep).is_none() {
                return Err(BrokerError::InvalidRetention(keep));
            }
            self.route(state, pending)
        };

        if let Some((publication, matched)) = routed {
            self.dispatcher.dispatch(publication, matched);
        }
        Ok(())
    }

    /// Park `pending` if paused or draining, otherwise release it.
    fn route(&self, state: &mut BrokerState, pending: PendingPublication) -> Option<Routed> {
        if !state.running || state.draining {
            state.paused.push_back(pending);
            return None;
        }
        self.release(state, pending)
    }

    /// Park `pending` on its topic's queue if that topic is paused, otherwise
    /// resolve its subscribers and retain it.
    fn release(&self, state: &mut BrokerState, pending: PendingPublication) -> Option<Routed> {
        if let Some(queue) = state.topic_queues.get_mut(pending.topic.as_str()) {
            queue.push_back(pending);
            return None;
        }

        let matched = state.cache.resolve(&pending.topic, &state.subscribers);

        let id = state.next_id;
        state.next_id = id.next();
        let keep = pending.keep;
        let publication = Arc::new(Publication {
            id,
            broker: self.name.clone(),
            topic: pending.topic,
            timestamp: pending.timestamp,
            payload: pending.payload,
            keep: (!keep.is_zero()).then_some(keep),
        });

        if let Err(e) = self.store.store(Arc::clone(&publication), keep) {
            warn!(broker = %self.name, error = %e, "publication not retained");
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        Some((publication, matched))
    }

    /// Retained publications whose topic matches any of `patterns`, oldest
    /// first.
    pub fn stored_publications(&self, patterns: &[&str]) -> Vec<Arc<Publication>> {
        let topics: Vec<Topic> = patterns.iter().map(|p| Topic::parse(*p)).collect();
        self.store.query(&topics)
    }

    // --- Counts ---

    /// Number of registered subscribers.
    pub fn subscribers_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Number of subscribers a publication to `topic` would reach.
    pub fn subscribers_count_for(&self, topic: &str) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return 0;
        }
        state
            .cache
            .resolve(&Topic::parse(topic), &state.subscribers)
            .len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.state.lock().subscribers.is_empty()
    }

    // --- Flow control ---

    /// Park every publication until [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.closed || !state.running {
            return;
        }
        state.running = false;
        debug!(broker = %self.name, "paused");
    }

    /// Release publications parked by [`pause`](Self::pause), oldest first.
    ///
    /// Publications arriving while the backlog is handed to the dispatcher
    /// queue up behind it.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.running {
                return;
            }
            state.running = true;
            debug!(broker = %self.name, released = state.paused.len(), "resumed");
            if state.draining {
                // The drain already running picks the backlog up.
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    /// Dispatch parked requests in order until none are left.
    ///
    /// Runs with `draining` set; clears it under the lock once the queue is
    /// empty or the broker is paused or closed again.
    fn drain(&self) {
        loop {
            let routed: Vec<Routed> = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.closed || !state.running || state.paused.is_empty() {
                    state.draining = false;
                    return;
                }
                let parked = std::mem::take(&mut state.paused);
                parked
                    .into_iter()
                    .filter_map(|pending| self.release(state, pending))
                    .collect()
            };

            for (publication, matched) in routed {
                self.dispatcher.dispatch(publication, matched);
            }
        }
    }

    /// Park publications to exactly `topic` until [`resume_topic`](Self::resume_topic).
    pub fn pause_topic(&self, topic: &str) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.topic_queues.entry(topic.to_string()).or_default();
        debug!(broker = %self.name, topic, "topic paused");
    }

    /// Release publications parked for `topic`, oldest first.
    ///
    /// They move to the front of the global queue, since everything there
    /// was published after them, and are released from there unless the
    /// whole broker is paused.
    pub fn resume_topic(&self, topic: &str) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let Some(parked) = state.topic_queues.remove(topic) else {
                return;
            };
            debug!(broker = %self.name, topic, released = parked.len(), "topic resumed");

            for pending in parked.into_iter().rev() {
                state.paused.push_front(pending);
            }
            if !state.running || state.draining {
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    pub fn is_paused(&self) -> bool {
        !self.state.lock().running
    }

    pub fn is_topic_paused(&self, topic: &str) -> bool {
        self.state.lock().topic_queues.contains_key(topic)
    }

    // --- Replay ---

    /// Hand `backlog` to `delivery` from the replay executor.
    fn replay(&self, subscriber: &str, delivery: Arc<Delivery>, backlog: Vec<Arc<Publication>>) {
        let count = backlog.len();
        let task = move || {
            for publication in backlog {
                delivery.deliver(publication);
            }
        };

        match self.replay_executor() {
            Some(executor) => {
                executor.submit(task, format!("replay:{}:{}", self.name, subscriber));
            }
            // No worker available: replay on the subscribing thread.
            None => task(),
        }
        debug!(broker = %self.name, subscriber, count, "replaying retained publications");
    }

    fn replay_executor(&self) -> Option<Arc<TaskExecutor>> {
        let mut slot = self.replay.lock();
        match &*slot {
            ReplaySlot::Running(executor) => return Some(Arc::clone(executor)),
            ReplaySlot::Closed => return None,
            ReplaySlot::Idle => {}
        }

        match TaskExecutor::start(
            format!("replay-{}", self.name),
            self.config.replay_workers,
            self.config.dispatch_queue_capacity,
        ) {
            Ok(executor) => {
                let executor = Arc::new(executor);
                *slot = ReplaySlot::Running(Arc::clone(&executor));
                Some(executor)
            }
            Err(e) => {
                error!(broker = %self.name, error = %e, "failed to start replay executor");
                None
            }
        }
    }

    // --- Lifecycle ---

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tear the broker down. Idempotent.
    ///
    /// Pending fan-outs and accepted deliveries are flushed; publications
    /// parked by pauses are dropped. Every later operation is a no-op.
    pub fn close(&self) {
        let registrations: Vec<Registration> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            state.cache.invalidate();

            let dropped = state.queued();
            if dropped > 0 {
                warn!(broker = %self.name, dropped, "dropping paused publications on close");
            }
            state.paused.clear();
            state.topic_queues.clear();

            state.subscribers.drain().map(|(_, reg)| reg).collect()
        };

        self.store.clear();
        self.detach_from_registry();

        let replay = match std::mem::replace(&mut *self.replay.lock(), ReplaySlot::Closed) {
            ReplaySlot::Running(executor) => Some(executor),
            ReplaySlot::Idle | ReplaySlot::Closed => None,
        };

        // From a handler, this thread may be the one a worker waits on to
        // drain a full queue. Stop all intake first so no worker stays
        // blocked; pending fan-outs to subscribers are then refused.
        if in_handler() {
            debug!(broker = %self.name, "closing from a subscriber handler");
            self.dispatcher.interrupt();
            if let Some(executor) = &replay {
                executor.interrupt();
            }
            for registration in &registrations {
                registration.delivery().interrupt();
            }
        }

        self.dispatcher.shutdown();
        if let Some(executor) = replay {
            executor.shutdown();
        }
        for registration in &registrations {
            registration.delivery().close();
        }

        info!(broker = %self.name, subscribers = registrations.len(), "broker closed");
    }

    fn detach_from_registry(&self) {
        let Some(map) = self.registry.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let removed = {
            let mut brokers = map.write();
            let is_self = brokers
                .get(&self.name)
                .is_some_and(|broker| std::ptr::eq(Arc::as_ptr(broker), self));
            if is_self {
                brokers.remove(&self.name)
            } else {
                None
            }
        };
        // Dropped outside the registry lock.
        drop(removed);
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            subscribers: state.subscribers.len(),
            published: self.published.load(Ordering::Relaxed),
            queued: state.queued(),
            delivered: self.counters.delivered(),
            failed: self.counters.failed(),
            refused: self.counters.refused(),
            retained: self.store.len(),
            dispatch_backlog: self.dispatcher.backlog(),
            delivery_backlog: state
                .subscribers
                .values()
                .map(|reg| reg.delivery().backlog())
                .sum(),
            cache: state.cache.stats(),
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name)
            .field("dispatch", &self.config.dispatch)
            .finish()
    }
}
