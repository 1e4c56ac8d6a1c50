//! Live connections of a node, keyed by peer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::connection::Connection;
use crate::fabric::NotificationSink;
use crate::protocol::Notification;
use crate::types::{Error, PeerId, Result};

#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<PeerId, Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `conn` until it closes.
    pub fn insert(self: &Arc<Self>, conn: Connection) {
        let peer = conn.peer();
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, conn.clone());

        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(table) = table.upgrade() {
                table.remove(peer);
            }
        });
    }

    pub fn remove(&self, peer: PeerId) -> Option<Connection> {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Close every connection. Teardown proceeds in the background.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationSink for ConnectionTable {
    async fn notify(&self, peer: PeerId, notification: Notification) -> Result<()> {
        let conn = self
            .get(peer)
            .ok_or_else(|| Error::connection_lost(format!("{} is not connected", peer)))?;
        conn.send_notification(notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HandlerPool, Router};
    use crate::types::{ObjectId, TransportConfig};
    use std::time::Duration;

    fn spawn_pair() -> (Connection, Connection) {
        let config = TransportConfig::default();
        let (a, b) = tokio::io::duplex(4096);
        let router = Arc::new(Router::new());
        (
            Connection::spawn(a, None, router.clone(), HandlerPool::new(1), &config),
            Connection::spawn(b, None, router, HandlerPool::new(1), &config),
        )
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_table() {
        let table = Arc::new(ConnectionTable::new());
        let (conn, _other) = spawn_pair();
        table.insert(conn.clone());
        assert_eq!(table.len(), 1);
        assert!(table.get(conn.peer()).is_some());

        conn.close();
        conn.closed().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_notify_unknown_peer_is_connection_lost() {
        let table = ConnectionTable::new();
        let err = table
            .notify(
                PeerId::new(),
                Notification::ProgramBuildComplete {
                    program: ObjectId::from_raw(1),
                    device: ObjectId::from_raw(2),
                    status: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
    }
}
