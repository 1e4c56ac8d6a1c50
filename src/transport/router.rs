//! Per-kind message routing.
//!
//! A [`Router`] is the `on_message` registration point: handlers are bound to
//! individual request and notification kinds, and every connection of a node
//! dispatches through one router.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::connection::Connection;
use crate::protocol::{Category, MessageKind, Notification, Request, Response};
use crate::types::status;

/// Receives inbound requests and notifications for one or more kinds.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request. The returned response is sent back on `conn`.
    async fn handle_request(&self, conn: &Connection, request: Request) -> Response {
        tracing::warn!(peer = %conn.peer(), kind = ?request.kind(), "request kind not handled");
        Response::Error(status::INVALID_OPERATION)
    }

    /// Handle a notification. Notifications from one connection are handled
    /// one at a time in arrival order.
    async fn handle_notification(&self, conn: &Connection, notification: Notification) {
        tracing::debug!(peer = %conn.peer(), kind = ?notification.kind(), "notification kind not handled");
    }

    /// The connection closed; every pending request on it has already failed.
    async fn on_disconnect(&self, _conn: &Connection) {}
}

/// Routing table from message kind to handler.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
    observers: Vec<Arc<dyn MessageHandler>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(|k| *k as u8).collect();
        kinds.sort_unstable();
        f.debug_struct("Router")
            .field("kinds", &kinds)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to one request or notification kind.
    pub fn on(mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Self {
        debug_assert!(kind.category() != Category::Response);
        self.handlers.insert(kind, handler);
        self
    }

    /// Bind `handler` to several kinds.
    pub fn on_all(
        mut self,
        kinds: impl IntoIterator<Item = MessageKind>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        for kind in kinds {
            self = self.on(kind, handler.clone());
        }
        self
    }

    /// Notify `handler` when any connection closes.
    pub fn observe_disconnect(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.observers.push(handler);
        self
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle_request(&self, conn: &Connection, request: Request) -> Response {
        match self.handlers.get(&request.kind()) {
            Some(handler) => handler.handle_request(conn, request).await,
            None => {
                tracing::warn!(peer = %conn.peer(), kind = ?request.kind(), "no handler for request");
                Response::Error(status::INVALID_OPERATION)
            }
        }
    }

    async fn handle_notification(&self, conn: &Connection, notification: Notification) {
        match self.handlers.get(&notification.kind()) {
            Some(handler) => handler.handle_notification(conn, notification).await,
            None => {
                tracing::debug!(peer = %conn.peer(), kind = ?notification.kind(), "no handler for notification, dropped");
            }
        }
    }

    async fn on_disconnect(&self, conn: &Connection) {
        for observer in &self.observers {
            observer.on_disconnect(conn).await;
        }
    }
}
