//! Client-side endpoint of one remote node.
//!
//! Owns at most one live [`Connection`] and re-establishes it according to the
//! configured [`ReconnectPolicy`].

use bytes::Buf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::connection::{Connection, HandlerPool};
use super::router::MessageHandler;
use super::table::ConnectionTable;
use crate::protocol::{Notification, Request, Response, PROTOCOL_VERSION};
use crate::types::{Error, NodeAddress, NodePrefix, ReconnectPolicy, Result, TransportConfig};

pub struct Peer {
    address: NodeAddress,
    local_node: NodePrefix,
    handler: Arc<dyn MessageHandler>,
    pool: HandlerPool,
    table: Arc<ConnectionTable>,
    config: TransportConfig,
    current: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("local_node", &self.local_node)
            .finish()
    }
}

impl Peer {
    /// Connect to `address` and complete the `Hello` exchange.
    pub async fn connect(
        address: NodeAddress,
        local_node: NodePrefix,
        handler: Arc<dyn MessageHandler>,
        pool: HandlerPool,
        table: Arc<ConnectionTable>,
        config: TransportConfig,
    ) -> Result<Arc<Peer>> {
        let peer = Arc::new(Peer {
            address,
            local_node,
            handler,
            pool,
            table,
            config,
            current: Mutex::new(None),
        });
        peer.connection().await?;
        Ok(peer)
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn establish(&self) -> Result<Connection> {
        let target = self.address.to_string();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                Error::connection_lost(format!(
                    "connect to {} timed out after {:?}",
                    target, self.config.connect_timeout
                ))
            })?
            .map_err(|e| Error::connection_lost(format!("cannot connect to {}: {}", target, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", target, e);
        }
        let remote = stream.peer_addr().ok();

        let conn = Connection::spawn(
            stream,
            remote,
            self.handler.clone(),
            self.pool.clone(),
            &self.config,
        );
        self.table.insert(conn.clone());

        let hello = Request::Hello {
            node_id: self.local_node.0,
            protocol_version: PROTOCOL_VERSION,
        };
        let response = match conn.send_request(hello).await.and_then(Response::into_result) {
            Ok(response) => response,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };
        if let Response::Info(mut raw) = response {
            if raw.remaining() >= 2 {
                conn.set_remote_node(NodePrefix(raw.get_u16()));
            }
        }
        tracing::info!(peer = %conn.peer(), node = ?conn.remote_node(), "connected to {}", target);
        Ok(conn)
    }

    /// The live connection, re-established when the policy allows.
    pub async fn connection(&self) -> Result<Connection> {
        self.acquire().await.map(|(conn, _)| conn)
    }

    /// The live connection and whether it had to be established just now.
    async fn acquire(&self) -> Result<(Connection, bool)> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_closed() {
                return Ok((conn.clone(), false));
            }
            match self.config.reconnect {
                ReconnectPolicy::Never => {
                    return Err(Error::connection_lost(format!(
                        "connection to {} lost",
                        self.address
                    )));
                }
                ReconnectPolicy::Once { backoff } => {
                    tracing::warn!("Connection to {} lost, reconnecting in {:?}", self.address, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        let conn = self.establish().await?;
        *current = Some(conn.clone());
        Ok((conn, true))
    }

    /// Send a request and map `Error(code)` responses to `Error::Remote`.
    ///
    /// A request that fails with `ConnectionLost` is resent at most once on a
    /// fresh connection when the reconnect policy allows.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.exchange(request).await.map(|(_, response)| response)
    }

    /// [`Peer::request`], also returning the connection that carried the
    /// answered request.
    ///
    /// One request reconnects at most once: a request that already went out
    /// on a freshly established connection is not resent.
    pub async fn exchange(&self, request: Request) -> Result<(Connection, Response)> {
        let (conn, fresh) = self.acquire().await?;
        match conn.send_request(request.clone()).await {
            Err(e) if e.is_connection_lost() && !fresh && self.config.reconnect.allows_reconnect() => {
                tracing::debug!(kind = ?request.kind(), "resending after connection loss: {}", e);
                let (conn, _) = self.acquire().await?;
                let response = conn.send_request(request).await?.into_result()?;
                Ok((conn, response))
            }
            other => Ok((conn, other?.into_result()?)),
        }
    }

    pub async fn notify(&self, notification: Notification) -> Result<()> {
        self.connection().await?.send_notification(notification).await
    }

    /// Close the live connection without reconnecting.
    pub async fn close(&self) {
        if let Some(conn) = self.current.lock().await.take() {
            conn.close();
            conn.closed().await;
        }
    }
}
