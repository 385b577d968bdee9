//! Retained publications for replay.
//!
//! Publications published with a keep duration stay here until their expiry
//! instant. Expired entries are pruned lazily whenever the store is written
//! or queried; there is no background sweeper.

use crate::error::{BrokerError, Result};
use crate::topic::Topic;
use crate::types::Publication;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

struct Retained {
    publication: Arc<Publication>,
    expires: Instant,
}

/// Insertion-ordered store of recent publications.
#[derive(Default)]
pub struct PublicationStore {
    entries: Mutex<VecDeque<Retained>>,
}

impl PublicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `publication` for `keep`. A zero duration retains nothing.
    ///
    /// Returns whether the publication was retained.
    pub fn store(&self, publication: Arc<Publication>, keep: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        prune(&mut entries, now);

        if keep.is_zero() {
            return Ok(false);
        }

        let expires = now
            .checked_add(keep)
            .ok_or(BrokerError::InvalidRetention(keep))?;
        entries.push_back(Retained {
            publication,
            expires,
        });
        Ok(true)
    }

    /// Retained publications whose topic matches any of `patterns`, oldest
    /// first.
    pub fn query(&self, patterns: &[Topic]) -> Vec<Arc<Publication>> {
        let mut entries = self.entries.lock();
        prune(&mut entries, Instant::now());

        entries
            .iter()
            .filter(|entry| patterns.iter().any(|p| p.matches(&entry.publication.topic)))
            .map(|entry| Arc::clone(&entry.publication))
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        prune(&mut entries, Instant::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

fn prune(entries: &mut VecDeque<Retained>, now: Instant) {
    let before = entries.len();
    entries.retain(|entry| entry.expires > now);
    let pruned = before - entries.len();
    if pruned > 0 {
        trace!(pruned, "expired publications pruned");
    }
}
