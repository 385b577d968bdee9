//! Registry entry for one subscriber.

use crate::topic::Topic;
use std::collections::HashMap;
use std::sync::Arc;

use super::delivery::Delivery;

/// A registered subscriber: its pattern bindings and bound strategy.
pub struct Registration {
    id: String,
    /// Registration order within the broker; breaks priority ties.
    order: u64,
    /// Pattern → priority.
    patterns: HashMap<Topic, i32>,
    delivery: Arc<Delivery>,
}

impl Registration {
    pub fn new(id: impl Into<String>, order: u64, delivery: Delivery) -> Self {
        Self {
            id: id.into(),
            order,
            patterns: HashMap::new(),
            delivery: Arc::new(delivery),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn delivery(&self) -> &Arc<Delivery> {
        &self.delivery
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Bind patterns at `priority`. An already-bound pattern takes the new
    /// priority.
    ///
    /// Returns the patterns that were not bound before.
    pub fn bind<I>(&mut self, priority: i32, patterns: I) -> Vec<Topic>
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut added = Vec::new();
        for pattern in patterns {
            if self.patterns.insert(pattern.clone(), priority).is_none() {
                added.push(pattern);
            }
        }
        added
    }

    /// Remove the given bindings, returning how many were bound.
    pub fn unbind<'a, I>(&mut self, patterns: I) -> usize
    where
        I: IntoIterator<Item = &'a Topic>,
    {
        patterns
            .into_iter()
            .filter(|pattern| self.patterns.remove(*pattern).is_some())
            .count()
    }

    /// Remove every binding, returning how many there were.
    pub fn unbind_all(&mut self) -> usize {
        let count = self.patterns.len();
        self.patterns.clear();
        count
    }

    /// Highest priority among the patterns matching `topic`, if any.
    pub fn priority_for(&self, topic: &Topic) -> Option<i32> {
        self.patterns
            .iter()
            .filter(|(pattern, _)| pattern.matches(topic))
            .map(|(_, priority)| *priority)
            .max()
    }
}
