//! Subscribers and how publications reach them.
//!
//! A subscriber is registered under a caller-supplied id together with a
//! handler and a [`DeliveryKind`]. Registration builds the matching
//! [`Delivery`] strategy, which owns any thread or queue the kind needs for
//! as long as the subscriber stays registered.
//!
//! # Example
//!
//! ```ignore
//! let sub = handler(|publication| {
//!     println!("{} -> {:?}", publication.topic, publication.payload);
//!     Ok(())
//! });
//! broker.register_subscriber("printer", sub, DeliveryKind::PersistentQueue)?;
//! broker.subscribe("printer", 0, &["metrics/*"])?;
//! ```

mod delivery;
mod registration;
mod types;

pub use delivery::Delivery;
pub(crate) use delivery::in_handler;
pub use registration::Registration;
pub use types::{
    handler, DeliveryCounters, DeliveryKind, FnSubscriber, HandlerError, HandlerResult,
    Subscriber,
};
