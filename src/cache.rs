//! Memoized subscriber resolution per literal topic.
//!
//! The cache maps a published topic string to the subscribers whose patterns
//! match it, sorted by descending priority. It is only touched while the
//! broker's mutation lock is held, and every registration change clears it
//! wholesale before the lock is released, so a lookup never returns a list
//! computed from an older registry.

use crate::subscribers::{Delivery, Registration};
use crate::topic::Topic;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// One resolved subscriber for a topic.
#[derive(Clone, Debug)]
pub struct Matched {
    pub priority: i32,
    pub subscriber: String,
    pub delivery: Arc<Delivery>,
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// LRU of resolved match lists, keyed by literal topic.
pub struct MatchCache {
    entries: LruCache<String, Arc<[Matched]>>,
    stats: CacheStats,
}

impl MatchCache {
    /// Create a cache holding at most `capacity` topics.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Subscribers matching `topic`, highest priority first.
    pub fn resolve(
        &mut self,
        topic: &Topic,
        registrations: &HashMap<String, Registration>,
    ) -> Arc<[Matched]> {
        if let Some(matched) = self.entries.get(topic.as_str()) {
            self.stats.hits += 1;
            return Arc::clone(matched);
        }

        self.stats.misses += 1;
        let matched = compute(topic, registrations);
        self.entries.put(topic.as_str().to_owned(), Arc::clone(&matched));
        matched
    }

    /// Drop every cached entry.
    pub fn invalidate(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
        }
        self.stats.invalidations += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Scan every registration for `topic`.
fn compute(topic: &Topic, registrations: &HashMap<String, Registration>) -> Arc<[Matched]> {
    let mut found: Vec<(i32, u64, &Registration)> = registrations
        .values()
        .filter_map(|reg| reg.priority_for(topic).map(|p| (p, reg.order(), reg)))
        .collect();

    // Descending priority, then registration order.
    found.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    found
        .into_iter()
        .map(|(priority, _, reg)| Matched {
            priority,
            subscriber: reg.id().to_owned(),
            delivery: Arc::clone(reg.delivery()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::{handler, DeliveryCounters, DeliveryKind};

    fn registry(entries: &[(&str, i32, &str)]) -> HashMap<String, Registration> {
        let mut regs: HashMap<String, Registration> = HashMap::new();
        for (order, (id, priority, pattern)) in entries.iter().enumerate() {
            let reg = regs.entry(id.to_string()).or_insert_with(|| {
                let delivery = Delivery::start(
                    id,
                    handler(|_| Ok(())),
                    DeliveryKind::Inline,
                    1,
                    Arc::new(DeliveryCounters::default()),
                )
                .unwrap();
                Registration::new(*id, order as u64, delivery)
            });
            reg.bind(*priority, [Topic::parse(*pattern)]);
        }
        regs
    }

    fn ids(matched: &[Matched]) -> Vec<&str> {
        matched.iter().map(|m| m.subscriber.as_str()).collect()
    }

    #[test]
    fn test_resolve_orders_by_priority() {
        let regs = registry(&[("s1", 1, "m/cpu"), ("s2", 5, "m/*"), ("s3", 3, "other")]);
        let mut cache = MatchCache::new(16);

        let matched = cache.resolve(&Topic::parse("m/cpu"), &regs);
        assert_eq!(ids(&matched), vec!["s2", "s1"]);
        assert_eq!(matched[0].priority, 5);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let regs = registry(&[("b", 2, "t"), ("a", 2, "t"), ("c", 2, "*")]);
        let mut cache = MatchCache::new(16);
        assert_eq!(ids(&cache.resolve(&Topic::parse("t"), &regs)), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_one_entry_per_subscriber_with_max_priority() {
        let regs = registry(&[("s1", 1, "a/b"), ("s1", 4, "a/?"), ("s1", 2, "*")]);
        let mut cache = MatchCache::new(16);

        let matched = cache.resolve(&Topic::parse("a/b"), &regs);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].priority, 4);
    }

    #[test]
    fn test_hit_miss_and_invalidate() {
        let mut regs = registry(&[("s1", 0, "x/y")]);
        let mut cache = MatchCache::new(16);
        let topic = Topic::parse("x/y");

        assert_eq!(cache.resolve(&topic, &regs).len(), 1);
        assert_eq!(cache.resolve(&topic, &regs).len(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);

        // A stale entry survives registry changes until invalidated.
        regs.extend(registry(&[("s2", 0, "x/*")]));
        assert_eq!(cache.resolve(&topic, &regs).len(), 1);

        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.resolve(&topic, &regs).len(), 2);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let regs = registry(&[("s1", 0, "*")]);
        let mut cache = MatchCache::new(2);
        for t in ["a", "b", "c"] {
            cache.resolve(&Topic::parse(t), &regs);
        }
        assert_eq!(cache.len(), 2);
    }
}
