//! The live set of connected peers.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::ConnectionId;
use parking_lot::RwLock;

use super::connection::ClientConnection;

/// Unordered set of connections keyed by id.
///
/// Iteration holds the read lock for its whole duration, so a removal either
/// happens before a broadcast sees the set or after it has finished.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    /// Returns whether an entry was removed. Removing twice is harmless.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.write().remove(id).is_some()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Visit every connection except `excluding`. `f` must not block.
    pub fn for_each<F>(&self, excluding: Option<&ConnectionId>, mut f: F)
    where
        F: FnMut(&Arc<ClientConnection>),
    {
        let conns = self.connections.read();
        for (id, conn) in conns.iter() {
            if Some(id) != excluding {
                f(conn);
            }
        }
    }

    /// Snapshot of all connections.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ClientConnection::new(ConnectionId::new(), tx)), rx)
    }

    #[test]
    fn add_and_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = make_connection();
        let (b, _rb) = make_connection();
        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&a.id));
        assert!(!registry.remove(&a.id));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&b.id));
        assert!(!registry.contains(&a.id));
    }

    #[test]
    fn adding_same_connection_twice_keeps_one_entry() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = make_connection();
        registry.add(a.clone());
        registry.add(a);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_unknown_is_false() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.remove(&ConnectionId::new()));
    }

    #[test]
    fn get_returns_registered_connection() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = make_connection();
        registry.add(a.clone());
        assert!(Arc::ptr_eq(&registry.get(&a.id).unwrap(), &a));
        assert!(registry.get(&ConnectionId::new()).is_none());
    }

    #[test]
    fn for_each_skips_excluded() {
        let registry = ConnectionRegistry::new();
        let conns: Vec<_> = (0..4).map(|_| make_connection()).collect();
        for (c, _) in &conns {
            registry.add(c.clone());
        }

        let excluded = &conns[1].0.id;
        let mut seen = Vec::new();
        registry.for_each(Some(excluded), |c| seen.push(c.id.clone()));
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(excluded));

        let mut all = 0;
        registry.for_each(None, |_| all += 1);
        assert_eq!(all, 4);
        assert_eq!(registry.snapshot().len(), 4);
    }

    #[test]
    fn concurrent_add_remove_and_iterate() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let (c, _rx) = make_connection();
                    registry.add(c.clone());
                    let mut n = 0;
                    registry.for_each(None, |_| n += 1);
                    assert!(n >= 1);
                    assert!(registry.remove(&c.id));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
