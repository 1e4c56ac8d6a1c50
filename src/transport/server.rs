//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, HandlerPool};
use super::router::MessageHandler;
use super::table::ConnectionTable;
use crate::types::TransportConfig;

/// Accepts peers and spawns a [`Connection`] for each.
pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    pool: HandlerPool,
    table: Arc<ConnectionTable>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("connections", &self.table.len())
            .finish()
    }
}

impl Server {
    /// Bind the listening socket. Port `0` picks a free port.
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn MessageHandler>,
        table: Arc<ConnectionTable>,
        config: TransportConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            pool: HandlerPool::new(config.handler_workers),
            table,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until [`Server::shutdown`].
    pub async fn serve(&self) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "Node listening on {} (max_connections={})",
            self.listener.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Node server shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Per-connection failures (e.g. reset before accept) are not fatal.
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                    }

                    let conn = Connection::spawn(
                        stream,
                        Some(peer),
                        self.handler.clone(),
                        self.pool.clone(),
                        &self.config,
                    );
                    tracing::debug!(
                        "Connection {} from {} (active={})",
                        conn.peer(),
                        peer,
                        self.config.max_connections - conn_semaphore.available_permits(),
                    );
                    self.table.insert(conn.clone());
                    tokio::spawn(async move {
                        conn.closed().await;
                        // the connection slot is released here
                        drop(permit);
                    });
                }
            }
        }
        self.table.close_all();
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
