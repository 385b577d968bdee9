//! # Switchboard
//!
//! An in-process, named publish/subscribe broker.
//!
//! ## Core Concepts
//!
//! - **Topics**: `/`-delimited names; subscription patterns may use `?` (one
//!   level) and `*` (the rest of the topic)
//! - **Subscribers**: registered under a unique id with a handler and a
//!   delivery kind deciding which thread runs the handler
//! - **Dispatch**: per-broker policy for fanning a publication out to its
//!   matched subscribers, highest priority first
//! - **Flow control**: pause and resume the whole broker or single topics
//! - **Retention**: publications may be kept for a while and are replayed to
//!   subscribers that bind a matching pattern later
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{handler, BrokerRegistry, DeliveryKind, DispatchKind};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let registry = BrokerRegistry::new();
//! let broker = registry.create("alerts", DispatchKind::Inline)?;
//!
//! broker.register_subscriber(
//!     "pager",
//!     handler(|p| {
//!         println!("{}: {:?}", p.topic, p.payload);
//!         Ok(())
//!     }),
//!     DeliveryKind::PersistentQueue,
//! )?;
//! broker.subscribe("pager", 10, &["alerts/*"])?;
//!
//! broker.publish_retained("alerts/disk", vec![json!("disk-full")], Duration::from_secs(10))?;
//! broker.close();
//! ```

pub mod broker;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod retention;
pub mod subscribers;
pub mod tasks;
pub mod topic;
pub mod types;

// Re-exports
pub use broker::{Broker, BrokerConfig, BrokerStats};
pub use cache::{CacheStats, MatchCache, Matched};
pub use dispatch::{DispatchKind, Dispatcher};
pub use error::{BrokerError, Result};
pub use mailbox::{Mailbox, WorkerMode};
pub use registry::BrokerRegistry;
pub use retention::PublicationStore;
pub use subscribers::{
    handler, Delivery, DeliveryCounters, DeliveryKind, FnSubscriber, HandlerError, HandlerResult,
    Registration, Subscriber,
};
pub use tasks::TaskExecutor;
pub use topic::Topic;
pub use types::*;
