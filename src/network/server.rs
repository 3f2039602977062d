//! Network Server
//!
//! TCP server accepting connections from cluster nodes and proxies. Every
//! accepted connection gets a `ConnectionId` that identifies it as the owner
//! of the registrations it makes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::manager::NodeManager;
use crate::protocol::{Request, Response};
use crate::registry::ConnectionId;

/// Network server for the node manager
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Request handler
    manager: Arc<NodeManager>,
    /// Next connection id to hand out
    next_connection: AtomicU64,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, manager: Arc<NodeManager>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            manager,
            next_connection: AtomicU64::new(1),
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Node manager listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| self.bind_address.clone())
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let conn = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
                            let peer_addr = addr.to_string();
                            let manager = Arc::clone(&self.manager);

                            tracing::debug!("Accepted {} from {}", conn, peer_addr);
                            tokio::spawn(async move {
                                handle_connection(socket, peer_addr, conn, manager).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Node manager server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve one connection, then release the nodes it owns
async fn handle_connection(socket: TcpStream, peer_addr: String, conn: ConnectionId, manager: Arc<NodeManager>) {
    if let Err(e) = serve_connection(socket, &peer_addr, conn, Arc::clone(&manager)).await {
        tracing::warn!("Connection error from {} ({}): {}", peer_addr, conn, e);
    }

    let closed = tokio::task::spawn_blocking(move || manager.connection_closed(conn)).await;
    match closed {
        Ok(0) => tracing::debug!("{} from {} closed", conn, peer_addr),
        Ok(n) => tracing::info!("{} from {} closed, {} nodes marked disconnected", conn, peer_addr, n),
        Err(e) => tracing::error!("Failed to release nodes of {}: {}", conn, e),
    }
}

async fn serve_connection(
    socket: TcpStream,
    peer_addr: &str,
    conn: ConnectionId,
    manager: Arc<NodeManager>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request = match read_message::<Request, _>(&mut reader).await {
            Ok(request) => request,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::trace!("Received {} from {} ({})", request.type_name(), peer_addr, conn);

        // Registry operations block on locks and file I/O
        let handler = Arc::clone(&manager);
        let response = tokio::task::spawn_blocking(move || handler.handle(conn, request))
            .await
            .unwrap_or_else(|e| {
                Response::from_error(&Error::Network(format!("request handler failed: {}", e)))
            });

        write_message(&mut writer, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::network::NetworkClient;
    use crate::reglog::RegisterLog;
    use crate::watermark::{SharedHorizon, DEFAULT_REPORT_THRESHOLD};
    use crate::registry::{NodeStatus, NodeType, Registration};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_disconnect_on_close() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(NodeManager::new(
            RegisterLog::new(dir.path().join("register.node")),
            Arc::new(SharedHorizon::default()),
            Arc::new(SystemClock),
            DEFAULT_REPORT_THRESHOLD,
            1024,
        ));
        let server = Arc::new(NetworkServer::new("127.0.0.1:0".into(), Arc::clone(&manager)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let client = NetworkClient::new(address, Duration::from_secs(2), Duration::from_secs(2));
        let response = client
            .request(Request::RegisterNode {
                registration: Registration::new(NodeType::Datanode, "dn1"),
                forwarded: false,
            })
            .await
            .unwrap();
        assert!(matches!(response, Response::Registered { .. }));

        let info = manager.registry().info(NodeType::Datanode, "dn1").unwrap();
        assert_eq!(info.status, NodeStatus::Connected);
        assert!(info.connection.is_some());

        client.close().await;

        let mut disconnected = false;
        for _ in 0..100 {
            let info = manager.registry().info(NodeType::Datanode, "dn1").unwrap();
            if info.status == NodeStatus::Disconnected {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(disconnected);

        server.stop();
        task.await.unwrap().unwrap();
    }
}
