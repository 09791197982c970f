//! Listener binding and accept loop

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::ListenerError;
use super::registry::Shared;
use crate::events::OperatorEvent;
use crate::session::reader::serve_connection;

/// Consecutive accept failures after which a listener gives up
const MAX_ACCEPT_FAILURES: u32 = 16;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerStatus {
    Starting,
    Listening,
    /// Stopped by request
    Stopped,
    /// Accept loop gave up
    Failed,
}

/// Bind `bind_address:port`, mapping the common failures to readable reasons
pub(crate) async fn bind_listener(
    bind_address: &str,
    port: u16,
) -> Result<TcpListener, ListenerError> {
    let addr = format!("{}:{}", bind_address, port);
    TcpListener::bind(&addr).await.map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                format!("Port already in use: {}. Another application may be using this port.", addr)
            }
            std::io::ErrorKind::PermissionDenied => format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                addr
            ),
            std::io::ErrorKind::AddrNotAvailable => format!(
                "Address not available: {}. The specified address is not valid on this system.",
                addr
            ),
            _ => format!("Failed to bind to {}: {}", addr, e),
        };
        ListenerError::BindFailed { port, reason }
    })
}

/// Handle to a running accept loop
pub struct ListenerHandle {
    /// Actual bound address (port differs from the request when it was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    status: Arc<parking_lot::Mutex<ListenerStatus>>,
}

impl ListenerHandle {
    /// Ask the accept loop to stop. Takes effect at its next suspension point.
    pub fn stop(&self) {
        info!("Stopping listener on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        // Capacity 1: a full channel already carries a stop request
        let _ = self.stop_tx.try_send(());
        *self.status.lock() = ListenerStatus::Stopped;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.lock()
    }
}

/// Spawn the accept loop for `listener`.
///
/// Every accepted socket gets its own read loop task.
pub(crate) fn start_accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    bound_addr: SocketAddr,
) -> ListenerHandle {
    let port = bound_addr.port();
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let status = Arc::new(parking_lot::Mutex::new(ListenerStatus::Starting));
    let status_clone = status.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        enum ExitReason {
            StopRequested,
            Failed(String),
        }

        {
            let mut status = status_clone.lock();
            if *status == ListenerStatus::Starting {
                *status = ListenerStatus::Listening;
            }
        }
        info!("Listening on {}", bound_addr);

        let mut failures = 0u32;
        let exit_reason = loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("Listener on port {} stopped by request", port);
                    break ExitReason::StopRequested;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            failures = 0;
                            if !running_clone.load(Ordering::SeqCst) {
                                break ExitReason::StopRequested;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("Accepted connection from {} on port {}", peer_addr, port);
                            tokio::spawn(serve_connection(shared.clone(), port, stream, peer_addr));
                        }
                        Err(e) => {
                            failures += 1;
                            error!("Accept error on port {} ({}/{}): {}", port, failures, MAX_ACCEPT_FAILURES, e);
                            if failures >= MAX_ACCEPT_FAILURES {
                                break ExitReason::Failed(e.to_string());
                            }
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        }
                    }
                }
            }
        };

        running_clone.store(false, Ordering::SeqCst);

        match exit_reason {
            ExitReason::StopRequested => {
                *status_clone.lock() = ListenerStatus::Stopped;
            }
            ExitReason::Failed(error) => {
                *status_clone.lock() = ListenerStatus::Failed;
                shared
                    .sink
                    .emit(OperatorEvent::ListenerFailed { port, error });
            }
        }

        info!("Accept loop for port {} exited", port);
    });

    ListenerHandle {
        bound_addr,
        running,
        stop_tx,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_in_use_reports_reason() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_listener("127.0.0.1", port).await {
            Err(ListenerError::BindFailed { port: p, reason }) => {
                assert_eq!(p, port);
                assert!(reason.contains("already in use"));
            }
            other => panic!("expected BindFailed, got {:?}", other.map(|_| ())),
        }
    }
}
