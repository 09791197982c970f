//! Port Registry
//!
//! Owns the listeners, the per-port connection sets and the operator's
//! focus. All three live behind one mutex so every structural change (add
//! or remove a port, add or remove a connection, move focus) is serialized.
//! The lock is never held across an await; per-connection I/O runs outside
//! it and treats a concurrently torn down connection as an ordinary failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::accept::{bind_listener, start_accept_loop, ListenerHandle, ListenerStatus};
use super::error::ListenerError;
use super::focus::SessionFocus;
use crate::config::PortdeckConfig;
use crate::events::{OperatorEvent, OperatorSink};
use crate::session::{Connection, ConnectionInfo, ConnectionSets};

/// Port status as reported by [`PortRegistry::list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Listening,
    /// The accept loop is gone but the port is still registered
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSummary {
    pub port: u16,
    pub status: PortStatus,
    pub connections: usize,
    pub focused: bool,
}

pub(crate) struct RegistryState {
    pub(crate) listeners: BTreeMap<u16, ListenerHandle>,
    pub(crate) connections: ConnectionSets,
    pub(crate) focus: SessionFocus,
}

/// State shared by the registry, its accept loops and every read loop
pub(crate) struct Shared {
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) config: Arc<PortdeckConfig>,
    pub(crate) sink: OperatorSink,
}

impl Shared {
    /// Add a freshly accepted connection. Returns false when its port was
    /// removed in the meantime.
    pub(crate) fn register(&self, conn: Arc<Connection>) -> bool {
        let mut state = self.state.lock();
        if !state.listeners.contains_key(&conn.port()) {
            return false;
        }
        state.connections.insert(conn);
        true
    }

    /// Remove a connection whose read loop has ended
    pub(crate) fn unregister(&self, conn: &Arc<Connection>) {
        let mut state = self.state.lock();
        state.connections.remove(conn);

        let (port, peer) = (conn.port(), conn.peer());
        if state.focus.is(port, peer) {
            state.focus.clear_connection();
            self.sink.emit(OperatorEvent::FocusLost { port, peer });
        }
    }

    /// Buffer a received message and show it live if its connection is focused
    pub(crate) fn deliver(&self, conn: &Connection, text: String) {
        let state = self.state.lock();
        let (port, peer) = (conn.port(), conn.peer());
        conn.push_message(text.clone());
        if state.focus.is(port, peer) {
            self.sink.emit(OperatorEvent::Message {
                port,
                peer,
                text,
                replayed: false,
            });
        }
    }
}

/// Registry of listening ports and their connections
#[derive(Clone)]
pub struct PortRegistry {
    pub(crate) shared: Arc<Shared>,
}

impl PortRegistry {
    pub fn new(config: PortdeckConfig, sink: OperatorSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState {
                    listeners: BTreeMap::new(),
                    connections: ConnectionSets::new(),
                    focus: SessionFocus::default(),
                }),
                config: Arc::new(config),
                sink,
            }),
        }
    }

    pub fn config(&self) -> &PortdeckConfig {
        &self.shared.config
    }

    /// Start listening on `port` and return the bound port (differs from the
    /// request only when `port` is 0). A failed bind leaves nothing behind.
    pub async fn add_port(&self, port: u16) -> Result<u16, ListenerError> {
        if port != 0 && self.shared.state.lock().listeners.contains_key(&port) {
            return Err(ListenerError::AlreadyListening(port));
        }

        let listener = bind_listener(&self.shared.config.bind_address, port).await?;
        let bound_addr = listener.local_addr()?;
        let bound = bound_addr.port();

        {
            let mut state = self.shared.state.lock();
            // Another add for the same port may have won the race while we bound
            if state.listeners.contains_key(&bound) {
                return Err(ListenerError::AlreadyListening(bound));
            }
            let handle = start_accept_loop(self.shared.clone(), listener, bound_addr);
            state.listeners.insert(bound, handle);
        }

        info!("Started listening on port {}", bound);
        self.shared
            .sink
            .emit(OperatorEvent::ListenerStarted { port: bound });
        Ok(bound)
    }

    /// Stop listening on `port` and mark its connections inactive.
    ///
    /// Returns how many connections were told to close. Their read loops
    /// remove them from the set as they exit.
    pub fn remove_port(&self, port: u16) -> Result<usize, ListenerError> {
        let closing = {
            let mut state = self.shared.state.lock();
            let handle = state
                .listeners
                .remove(&port)
                .ok_or(ListenerError::NotListening(port))?;
            handle.stop();
            state.connections.deactivate_port(port)
        };

        info!("Stopped listening on port {} ({} connections closing)", port, closing);
        self.shared
            .sink
            .emit(OperatorEvent::ListenerStopped { port });
        Ok(closing)
    }

    /// Registered ports in ascending order
    pub fn list(&self) -> Vec<PortSummary> {
        let state = self.shared.state.lock();
        state
            .listeners
            .iter()
            .map(|(&port, handle)| PortSummary {
                port,
                status: match handle.status() {
                    ListenerStatus::Starting | ListenerStatus::Listening => PortStatus::Listening,
                    ListenerStatus::Stopped | ListenerStatus::Failed => PortStatus::Ended,
                },
                connections: state.connections.count(port),
                focused: state.focus.port() == Some(port),
            })
            .collect()
    }

    /// Connections of `port` in id order
    pub fn connections(&self, port: u16) -> Result<Vec<ConnectionInfo>, ListenerError> {
        let state = self.shared.state.lock();
        if !state.listeners.contains_key(&port) {
            return Err(ListenerError::NotListening(port));
        }

        let set = state.connections.get(port);
        if set.is_empty() {
            return Err(ListenerError::NoConnections(port));
        }

        Ok(set
            .iter()
            .enumerate()
            .map(|(id, conn)| conn.info(id, state.focus.is(port, conn.peer())))
            .collect())
    }

    /// Total live connections across every port
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.total()
    }

    /// Remove every registered port
    pub fn shutdown(&self) {
        let ports: Vec<u16> = self.shared.state.lock().listeners.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.remove_port(port) {
                debug!("Port {} already gone during shutdown: {}", port, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    pub(crate) fn test_registry(
        temp: &TempDir,
    ) -> (PortRegistry, mpsc::UnboundedReceiver<OperatorEvent>) {
        let config = PortdeckConfig {
            bind_address: "127.0.0.1".into(),
            log_dir: temp.path().join("logs"),
            downloads_dir: temp.path().join("downloads"),
            ..PortdeckConfig::default()
        };
        let (sink, rx) = OperatorSink::channel();
        (PortRegistry::new(config, sink), rx)
    }

    /// Poll until `check` holds, for at most two seconds
    pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_add_port_twice_fails() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);

        let port = registry.add_port(0).await.unwrap();
        assert!(matches!(
            registry.add_port(port).await,
            Err(ListenerError::AlreadyListening(p)) if p == port
        ));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_port_has_no_side_effects() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);
        let port = registry.add_port(0).await.unwrap();

        assert!(matches!(
            registry.remove_port(port.wrapping_add(1)),
            Err(ListenerError::NotListening(_))
        ));
        assert_eq!(registry.list().len(), 1);

        registry.remove_port(port).unwrap();
        assert!(registry.list().is_empty());
        assert!(matches!(
            registry.remove_port(port),
            Err(ListenerError::NotListening(p)) if p == port
        ));
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        assert!(matches!(
            registry.add_port(port).await,
            Err(ListenerError::BindFailed { .. })
        ));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_connections() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);
        let port = registry.add_port(0).await.unwrap();

        let _a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_until(|| registry.connection_count() == 2).await;

        let list = registry.list();
        assert_eq!(
            list,
            vec![PortSummary {
                port,
                status: PortStatus::Listening,
                connections: 2,
                focused: false,
            }]
        );

        let infos = registry.connections(port).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, 0);
        assert_eq!(infos[1].id, 1);
        assert!(!infos[0].shell_mode);
    }

    #[tokio::test]
    async fn test_connections_errors() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);

        assert!(matches!(
            registry.connections(1),
            Err(ListenerError::NotListening(1))
        ));

        let port = registry.add_port(0).await.unwrap();
        assert!(matches!(
            registry.connections(port),
            Err(ListenerError::NoConnections(p)) if p == port
        ));
    }

    #[tokio::test]
    async fn test_peer_close_removes_connection() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);
        let port = registry.add_port(0).await.unwrap();

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_until(|| registry.connection_count() == 1).await;

        peer.shutdown().await.unwrap();
        drop(peer);
        wait_until(|| registry.connection_count() == 0).await;
        assert_eq!(registry.list()[0].connections, 0);
    }

    #[tokio::test]
    async fn test_remove_port_closes_idle_connections() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, _events) = test_registry(&temp);
        let port = registry.add_port(0).await.unwrap();

        let _a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_until(|| registry.connection_count() == 2).await;

        let conns: Vec<Arc<Connection>> = registry.shared.state.lock().connections.get(port).to_vec();
        assert_eq!(registry.remove_port(port).unwrap(), 2);
        assert!(conns.iter().all(|c| !c.is_active()));

        // The peers stay silent; cancellation still ends both read loops
        wait_until(|| registry.connection_count() == 0).await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let temp = tempfile::tempdir().unwrap();
        let (registry, mut events) = test_registry(&temp);
        let a = registry.add_port(0).await.unwrap();
        let b = registry.add_port(0).await.unwrap();

        registry.shutdown();
        assert!(registry.list().is_empty());

        let mut stopped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OperatorEvent::ListenerStopped { port } = event {
                stopped.push(port);
            }
        }
        stopped.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(stopped, expected);
    }
}
