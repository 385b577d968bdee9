//! Core types shared by the broker components.

use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ordered payload carried by a publication.
pub type Payload = Vec<serde_json::Value>;

/// Unique identifier for a publication (per broker, monotonically increasing).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicationId(pub u64);

impl PublicationId {
    pub fn next(self) -> Self {
        PublicationId(self.0 + 1)
    }
}

impl fmt::Debug for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicationId({})", self.0)
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single publication, immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publication {
    /// Unique identifier (assigned by the broker).
    pub id: PublicationId,

    /// Name of the broker that accepted the publication.
    pub broker: String,

    /// Literal topic the publication was addressed to.
    pub topic: Topic,

    /// When `publish` was called.
    pub timestamp: Timestamp,

    /// Application-defined values.
    pub payload: Payload,

    /// How long the broker retains the publication for replay.
    pub keep: Option<Duration>,
}

impl Publication {
    /// First payload value, if any.
    pub fn first(&self) -> Option<&serde_json::Value> {
        self.payload.first()
    }

    /// Whether the publication was retained for replay.
    pub fn is_retained(&self) -> bool {
        self.keep.is_some()
    }
}

/// A publish request parked while the broker or its topic is paused.
#[derive(Clone, Debug)]
pub struct PendingPublication {
    pub topic: Topic,
    pub payload: Payload,
    pub timestamp: Timestamp,
    pub keep: Duration,
}

impl PendingPublication {
    pub fn new(topic: Topic, payload: Payload, keep: Duration) -> Self {
        Self {
            topic,
            payload,
            timestamp: Timestamp::now(),
            keep,
        }
    }
}
