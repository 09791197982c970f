//! Connection sets
//!
//! Live connections per port, kept in insertion order so a connection's
//! position is a stable id for as long as no earlier connection leaves.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::connection::Connection;

#[derive(Debug, Default)]
pub struct ConnectionSets {
    sets: BTreeMap<u16, Vec<Arc<Connection>>>,
}

impl ConnectionSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Arc<Connection>) {
        self.sets.entry(conn.port()).or_default().push(conn);
    }

    /// Remove `conn`; the port's entry goes away with its last connection
    pub fn remove(&mut self, conn: &Arc<Connection>) -> bool {
        let port = conn.port();
        let Some(set) = self.sets.get_mut(&port) else {
            return false;
        };

        let before = set.len();
        set.retain(|c| !Arc::ptr_eq(c, conn));
        let removed = set.len() != before;

        if set.is_empty() {
            self.sets.remove(&port);
        }
        removed
    }

    /// Connections of `port` in id order
    pub fn get(&self, port: u16) -> &[Arc<Connection>] {
        self.sets.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, port: u16) -> usize {
        self.get(port).len()
    }

    pub fn nth(&self, port: u16, id: usize) -> Option<Arc<Connection>> {
        self.get(port).get(id).cloned()
    }

    /// Look up a connection by peer address, returning its id too
    pub fn find(&self, port: u16, peer: SocketAddr) -> Option<(usize, Arc<Connection>)> {
        self.get(port)
            .iter()
            .enumerate()
            .find(|(_, c)| c.peer() == peer)
            .map(|(id, c)| (id, c.clone()))
    }

    /// Flip every connection of `port` inactive; returns how many
    pub fn deactivate_port(&self, port: u16) -> usize {
        let set = self.get(port);
        for conn in set {
            conn.deactivate();
        }
        set.len()
    }

    pub fn total(&self) -> usize {
        self.sets.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OperatorSink;
    use crate::session::connection::test_pair;

    #[tokio::test]
    async fn test_insertion_order_is_id_order() {
        let (a, _pa) = test_pair(9000, 10, OperatorSink::noop()).await;
        let (b, _pb) = test_pair(9000, 10, OperatorSink::noop()).await;
        let (c, _pc) = test_pair(9001, 10, OperatorSink::noop()).await;

        let mut sets = ConnectionSets::new();
        sets.insert(a.clone());
        sets.insert(b.clone());
        sets.insert(c.clone());

        assert_eq!(sets.count(9000), 2);
        assert!(Arc::ptr_eq(&sets.nth(9000, 0).unwrap(), &a));
        assert!(Arc::ptr_eq(&sets.nth(9000, 1).unwrap(), &b));
        assert!(sets.nth(9000, 2).is_none());
        assert_eq!(sets.find(9000, b.peer()).map(|(id, _)| id), Some(1));
        assert_eq!(sets.total(), 3);
    }

    #[tokio::test]
    async fn test_remove_last_deletes_entry() {
        let (a, _pa) = test_pair(9000, 10, OperatorSink::noop()).await;

        let mut sets = ConnectionSets::new();
        sets.insert(a.clone());
        assert!(sets.remove(&a));
        assert!(!sets.remove(&a));
        assert!(sets.get(9000).is_empty());
        assert!(sets.sets.is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_port() {
        let (a, _pa) = test_pair(9000, 10, OperatorSink::noop()).await;
        let (b, _pb) = test_pair(9001, 10, OperatorSink::noop()).await;

        let mut sets = ConnectionSets::new();
        sets.insert(a.clone());
        sets.insert(b.clone());

        assert_eq!(sets.deactivate_port(9000), 1);
        assert!(!a.is_active());
        assert!(b.is_active());
    }
}
