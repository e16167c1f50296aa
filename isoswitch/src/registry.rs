//! Live transports keyed by socket.

use dashmap::DashMap;
use isoswitch_core::connection::SocketKey;
use std::sync::Arc;

use crate::transport::Transport;

/// Concurrent map from [`SocketKey`] to its running transport.
///
/// Lookups clone the `Arc` out so no map guard is held while sending.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    transports: DashMap<SocketKey, Arc<Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SocketKey) -> Option<Arc<Transport>> {
        self.transports.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Register a transport, returning the one it replaced.
    pub fn insert(&self, transport: Arc<Transport>) -> Option<Arc<Transport>> {
        self.transports.insert(transport.key().clone(), transport)
    }

    pub fn remove(&self, key: &SocketKey) -> Option<Arc<Transport>> {
        self.transports.remove(key).map(|(_, t)| t)
    }

    /// All transports, ordered by key.
    pub fn snapshot(&self) -> Vec<Arc<Transport>> {
        let mut all: Vec<Arc<Transport>> = self
            .transports
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoswitch_core::metadata::ServerConfig;

    #[test]
    fn test_insert_replace_remove() {
        let registry = TransportRegistry::new();
        let key = SocketKey::server("pay");
        let config = ServerConfig::new("127.0.0.1", 0);

        assert!(registry
            .insert(Arc::new(Transport::server(key.clone(), &config)))
            .is_none());
        assert!(registry
            .insert(Arc::new(Transport::server(key.clone(), &config)))
            .is_some());
        assert_eq!(registry.len(), 1);

        let found = registry.get(&key).unwrap();
        assert!(!found.is_up());
        assert!(registry.remove(&key).is_some());
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = TransportRegistry::new();
        let config = ServerConfig::new("127.0.0.1", 0);
        for name in ["b", "a", "c"] {
            registry.insert(Arc::new(Transport::server(SocketKey::server(name), &config)));
        }
        let names: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|t| t.key().channel.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
