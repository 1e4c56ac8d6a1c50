//! One full-duplex channel to a peer node.
//!
//! Each connection runs three tasks:
//! ```text
//!   socket ──► reader ──► inbound queue ──► dispatcher ──► handler pool
//!                 │                                            │
//!                 └─► pending table (responses)                ▼
//!   socket ◄── writer ◄──────────── outbound queue ◄──── send_* / responses
//! ```
//! Both queues are bounded: a full outbound queue makes senders wait, a full
//! inbound queue stops the reader, which in turn stalls the peer's writer.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::pending::{Completion, PendingRequests};
use super::router::MessageHandler;
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::{Message, Notification, Request, Response};
use crate::types::{CorrelationId, Error, NodePrefix, PeerId, Result, TransportConfig};

/// Node-wide bound on concurrently running request handlers.
#[derive(Debug, Clone)]
pub struct HandlerPool {
    permits: Arc<Semaphore>,
}

impl HandlerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[derive(Debug)]
enum Inbound {
    Request(CorrelationId, Request),
    Notification(Notification),
}

struct Inner {
    peer: PeerId,
    remote_addr: Option<SocketAddr>,
    remote_node: OnceLock<NodePrefix>,
    outbound: mpsc::Sender<(u8, Bytes)>,
    pending: PendingRequests,
    shutdown: CancellationToken,
    done: CancellationToken,
    request_timeout: Option<Duration>,
    max_frame_bytes: u32,
}

/// Handle to a live (or closed) connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("remote_node", &self.inner.remote_node.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start the reader, writer and dispatcher tasks over `stream`.
    pub fn spawn<S>(
        stream: S,
        remote_addr: Option<SocketAddr>,
        handler: Arc<dyn MessageHandler>,
        pool: HandlerPool,
        config: &TransportConfig,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);

        let conn = Connection {
            inner: Arc::new(Inner {
                peer: PeerId::new(),
                remote_addr,
                remote_node: OnceLock::new(),
                outbound: outbound_tx,
                pending: PendingRequests::new(),
                shutdown: CancellationToken::new(),
                done: CancellationToken::new(),
                request_timeout: config.request_timeout,
                max_frame_bytes: config.max_frame_bytes,
            }),
        };
        tracing::debug!(peer = %conn.peer(), remote = ?remote_addr, "connection established");

        // Both tasks keep the caller's span.
        tokio::spawn(dispatch_loop(conn.clone(), inbound_rx, handler.clone(), pool).in_current_span());
        tokio::spawn(
            supervise(
                conn.clone(),
                reader,
                writer,
                outbound_rx,
                inbound_tx,
                handler,
                config.write_timeout,
            )
            .in_current_span(),
        );
        conn
    }

    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Prefix the peer announced in `Hello`.
    pub fn remote_node(&self) -> Option<NodePrefix> {
        self.inner.remote_node.get().copied()
    }

    pub(crate) fn set_remote_node(&self, node: NodePrefix) {
        if self.inner.remote_node.set(node).is_err() {
            tracing::debug!(peer = %self.peer(), "peer announced itself twice");
        }
    }

    /// Send a request and wait for the matching response, using the
    /// configured default deadline.
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        self.send_request_with_deadline(request, self.inner.request_timeout)
            .await
    }

    /// Send a request and wait for the matching response.
    ///
    /// Completes with `Timeout` when `deadline` expires (a late response is
    /// then discarded) and with `ConnectionLost` when the connection closes
    /// first. Dropping the returned future does not cancel the request on the
    /// wire.
    pub async fn send_request_with_deadline(
        &self,
        request: Request,
        deadline: Option<Duration>,
    ) -> Result<Response> {
        let (correlation, rx) = self.inner.pending.register()?;
        let kind = request.kind();
        let frame = Message::Request {
            correlation,
            body: request,
        }
        .encode();
        if let Err(e) = self.enqueue(frame).await {
            self.inner.pending.forget(correlation);
            return Err(e);
        }
        tracing::trace!(peer = %self.peer(), %correlation, ?kind, "request sent");

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.pending.abandon(correlation, limit);
                    return Err(Error::timeout(format!(
                        "{:?} {} got no response within {:?}",
                        kind, correlation, limit
                    )));
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| Error::connection_lost("pending request dropped"))?
    }

    /// Send a one-way notification. Ordered with every other frame sent on
    /// this connection.
    pub async fn send_notification(&self, notification: Notification) -> Result<()> {
        self.enqueue(Message::Notification(notification).encode())
            .await
    }

    pub(crate) async fn send_response(
        &self,
        correlation: CorrelationId,
        response: Response,
    ) -> Result<()> {
        self.enqueue(
            Message::Response {
                correlation,
                body: response,
            }
            .encode(),
        )
        .await
    }

    async fn enqueue(&self, frame: (u8, Bytes)) -> Result<()> {
        if frame.1.len() >= self.inner.max_frame_bytes as usize {
            return Err(Error::validation(format!(
                "frame of {} bytes exceeds max_frame_bytes",
                frame.1.len() + 1
            )));
        }
        if self.is_closed() {
            return Err(Error::connection_lost(format!("{} is closed", self.peer())));
        }
        // Waits while the outbound queue is at its high-water mark.
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                Err(Error::connection_lost(format!("{} closed while sending", self.peer())))
            }
            sent = self.inner.outbound.send(frame) => {
                sent.map_err(|_| Error::connection_lost(format!("{} writer stopped", self.peer())))
            }
        }
    }

    /// Request requests outstanding on this connection.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the connection. Pending requests fail with `ConnectionLost`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until teardown (pending failures and disconnect handlers) is done.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }
}

async fn supervise<R, W>(
    conn: Connection,
    reader: R,
    writer: W,
    outbound: mpsc::Receiver<(u8, Bytes)>,
    inbound: mpsc::Sender<Inbound>,
    handler: Arc<dyn MessageHandler>,
    write_timeout: Duration,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_frame_bytes = conn.inner.max_frame_bytes;
    let reason = tokio::select! {
        result = read_loop(&conn, reader, inbound, max_frame_bytes) => match result {
            Ok(()) => "peer closed the connection".to_string(),
            Err(Error::Protocol(msg)) => {
                tracing::warn!(peer = %conn.peer(), "protocol error, closing connection: {}", msg);
                format!("protocol error: {}", msg)
            }
            Err(e) => e.to_string(),
        },
        result = write_loop(writer, outbound, write_timeout) => match result {
            Ok(()) => "outbound queue closed".to_string(),
            Err(e) => e.to_string(),
        },
        _ = conn.inner.shutdown.cancelled() => "closed locally".to_string(),
    };

    conn.inner.shutdown.cancel();
    let failed = conn.inner.pending.fail_all(&reason);
    tracing::info!(peer = %conn.peer(), failed_requests = failed, "connection closed: {}", reason);
    handler.on_disconnect(&conn).await;
    conn.inner.done.cancel();
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: &Connection,
    mut reader: R,
    inbound: mpsc::Sender<Inbound>,
    max_frame_bytes: u32,
) -> Result<()> {
    loop {
        let Some((kind, payload)) = read_frame(&mut reader, max_frame_bytes).await? else {
            return Ok(());
        };
        let item = match Message::decode(kind, payload)? {
            Message::Response { correlation, body } => {
                match conn.inner.pending.complete(correlation, body) {
                    Completion::Delivered => {}
                    Completion::Discarded => {
                        tracing::debug!(peer = %conn.peer(), %correlation, "late response discarded");
                    }
                    Completion::Unknown => {
                        tracing::warn!(peer = %conn.peer(), %correlation, "response with unknown correlation id dropped");
                    }
                }
                continue;
            }
            Message::Request { correlation, body } => Inbound::Request(correlation, body),
            Message::Notification(n) => Inbound::Notification(n),
        };
        // Blocks while the dispatcher is behind; the peer stalls, nothing is dropped.
        inbound
            .send(item)
            .await
            .map_err(|_| Error::internal("dispatcher stopped"))?;
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<(u8, Bytes)>,
    write_timeout: Duration,
) -> Result<()> {
    while let Some((kind, payload)) = outbound.recv().await {
        tokio::time::timeout(write_timeout, write_frame(&mut writer, kind, &payload))
            .await
            .map_err(|_| {
                tracing::warn!("Write timeout ({:?}), dropping connection", write_timeout);
                Error::timeout("write timeout")
            })??;
    }
    Ok(())
}

async fn dispatch_loop(
    conn: Connection,
    mut inbound: mpsc::Receiver<Inbound>,
    handler: Arc<dyn MessageHandler>,
    pool: HandlerPool,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = conn.inner.shutdown.cancelled() => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            Inbound::Notification(notification) => {
                handler.handle_notification(&conn, notification).await;
            }
            Inbound::Request(correlation, request) => {
                let permit = tokio::select! {
                    biased;
                    _ = conn.inner.shutdown.cancelled() => break,
                    permit = pool.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let conn = conn.clone();
                let handler = handler.clone();
                tokio::spawn(
                    async move {
                        let _permit = permit;
                        let kind = request.kind();
                        let response = handler.handle_request(&conn, request).await;
                        if let Err(e) = conn.send_response(correlation, response).await {
                            tracing::debug!(peer = %conn.peer(), %correlation, ?kind, "response not sent: {}", e);
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }
    // Anything still queued is discarded with the connection.
    let dropped = inbound.len();
    if dropped > 0 {
        tracing::debug!(peer = %conn.peer(), dropped, "inbound messages discarded on close");
    }
}
