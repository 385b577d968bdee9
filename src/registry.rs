//! Process-owned lookup of brokers by name.
//!
//! A [`BrokerRegistry`] is an ordinary value: create one where the
//! application starts up and pass clones to whoever needs to look brokers
//! up. Clones share the same map. A broker created through a registry
//! removes itself from it when closed.

use crate::broker::{Broker, BrokerConfig};
use crate::dispatch::DispatchKind;
use crate::error::{BrokerError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub(crate) type BrokerMap = RwLock<HashMap<String, Arc<Broker>>>;

/// Shared name → broker map.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    brokers: Arc<BrokerMap>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a broker with the default configuration.
    pub fn create(&self, name: &str, dispatch: DispatchKind) -> Result<Arc<Broker>> {
        self.create_with_config(name, BrokerConfig::with_dispatch(dispatch))
    }

    /// Create and register a broker.
    pub fn create_with_config(&self, name: &str, config: BrokerConfig) -> Result<Arc<Broker>> {
        let mut brokers = self.brokers.write();
        if brokers.contains_key(name) {
            return Err(BrokerError::BrokerExists(name.to_string()));
        }

        let broker = Arc::new(Broker::build(
            name.to_string(),
            config,
            Some(Arc::downgrade(&self.brokers)),
        )?);
        brokers.insert(name.to_string(), Arc::clone(&broker));
        Ok(broker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Broker>> {
        self.brokers.read().get(name).cloned()
    }

    /// Unregister a broker without closing it.
    pub fn remove(&self, name: &str) -> Option<Arc<Broker>> {
        let removed = self.brokers.write().remove(name);
        if removed.is_some() {
            debug!(broker = name, "broker removed from registry");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.brokers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.brokers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.read().is_empty()
    }

    /// Close every registered broker, leaving the registry empty.
    pub fn close_all(&self) {
        let brokers: Vec<Arc<Broker>> = self.brokers.read().values().cloned().collect();
        for broker in brokers {
            broker.close();
        }
    }
}

impl std::fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("brokers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let registry = BrokerRegistry::new();
        let broker = registry.create("events", DispatchKind::Inline).unwrap();

        let found = registry.get("events").unwrap();
        assert!(Arc::ptr_eq(&broker, &found));
        assert_eq!(found.name(), "events");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = BrokerRegistry::new();
        registry.create("events", DispatchKind::Inline).unwrap();
        let result = registry.create("events", DispatchKind::Detached);
        assert!(matches!(result, Err(BrokerError::BrokerExists(name)) if name == "events"));
    }

    #[test]
    fn test_close_removes_from_registry() {
        let registry = BrokerRegistry::new();
        let broker = registry.create("a", DispatchKind::QueuedEphemeral).unwrap();
        registry.create("b", DispatchKind::Inline).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);

        broker.close();
        assert_eq!(registry.names(), vec!["b"]);

        // the name is free again
        registry.create("a", DispatchKind::Inline).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_closing_a_removed_broker_leaves_replacement() {
        let registry = BrokerRegistry::new();
        let old = registry.remove("x");
        assert!(old.is_none());

        let first = registry.create("x", DispatchKind::Inline).unwrap();
        registry.remove("x").unwrap();
        let second = registry.create("x", DispatchKind::Inline).unwrap();

        first.close();
        assert!(Arc::ptr_eq(&registry.get("x").unwrap(), &second));
    }

    #[test]
    fn test_close_all() {
        let registry = BrokerRegistry::new();
        let a = registry.create("a", DispatchKind::QueuedPersistent).unwrap();
        registry.create("b", DispatchKind::Detached).unwrap();

        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.is_closed());
    }
}
