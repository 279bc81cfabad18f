//! The per-connection actor.
//!
//! Each accepted socket is owned by exactly one task running [`run`], which
//! multiplexes the inbound frame stream, the bounded outbound queue, the
//! heartbeat timer and the close signal. Everything else holds a cheap
//! [`Connection`] handle and talks to the socket purely through the queue.

use crate::config::SocketConfig;
use crate::error::EnqueueError;
use crate::hub::Hub;
use crate::router::Router;
use crate::types::{ConnectionId, FrameKind, SocketMessage};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

/// Handle to a live connection.
///
/// Clones share the same underlying connection; identity, equality and
/// hashing are by [`ConnectionId`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    outbound: mpsc::Sender<SocketMessage>,
    router: Arc<Router>,
    close: Notify,
    closing: AtomicBool,
    extension: OnceCell<Arc<dyn Any + Send + Sync>>,
}

impl Connection {
    /// Create a handle plus the receiving half of its outbound queue. The
    /// receiver is consumed by the actor task in [`run`].
    pub(crate) fn new(
        router: Arc<Router>,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<SocketMessage>) {
        let (outbound, rx) = mpsc::channel(queue_size);
        let connection = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::new(),
                outbound,
                router,
                close: Notify::new(),
                closing: AtomicBool::new(false),
                extension: OnceCell::new(),
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Encode an event with the active protocol and enqueue it.
    ///
    /// Never blocks: an encode failure drops the emit silently and a full
    /// queue drops the frame with a warning. Delivery failures are handled
    /// by the actor, not the caller.
    pub fn emit<T: Serialize>(&self, event: &str, value: &T) {
        let protocol = self.inner.router.protocol();
        let frame = serde_json::to_value(value)
            .map_err(|e| crate::error::ProtocolError::Encode(e.to_string()))
            .and_then(|value| protocol.marshal(&value))
            .and_then(|payload| protocol.pack(event, &payload));
        match frame {
            Ok(frame) => {
                if let Err(reason) = self.send_raw(frame) {
                    warn!(id = %self.id(), event, %reason, "dropping emitted event");
                }
            }
            Err(error) => debug!(id = %self.id(), event, %error, "dropping unencodable emit"),
        }
    }

    /// Enqueue pre-encoded wire bytes without blocking.
    ///
    /// Errors are returned so brokers can evict unresponsive receivers.
    pub fn send_raw(&self, data: Vec<u8>) -> Result<(), EnqueueError> {
        let message = match self.inner.router.protocol().write_kind() {
            FrameKind::Text => match String::from_utf8(data) {
                Ok(text) => SocketMessage::Text(text),
                Err(raw) => SocketMessage::Binary(raw.into_bytes()),
            },
            FrameKind::Binary => SocketMessage::Binary(data),
        };
        self.inner.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Ask the actor to send a close frame and tear the connection down.
    /// Idempotent; the first call wins.
    pub fn close(&self) {
        if !self.inner.closing.swap(true, Ordering::SeqCst) {
            self.inner.close.notify_one();
        }
    }

    /// Whether [`close`](Self::close) has been requested.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Attach opaque per-connection data. The slot is write-once; returns
    /// `false` when something was already attached.
    pub fn set_extension<T: Any + Send + Sync>(&self, value: T) -> bool {
        self.inner.extension.set(Arc::new(value)).is_ok()
    }

    /// Read back the extension attached at connect time, if any.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .extension
            .get()
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    async fn closed(&self) {
        self.inner.close.notified().await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Drive one connection until it dies, then run its teardown exactly once.
///
/// Inbound pongs extend the read deadline; pings are answered in place; data
/// frames matching the protocol's read kind are dispatched through the
/// router. The loop ends on transport errors, deadline expiry, queue
/// closure, heartbeat failure or a local close request.
pub(crate) async fn run<S>(
    connection: Connection,
    mut socket: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<SocketMessage>,
    hub: Hub,
    config: SocketConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let router = connection.router().clone();
    let read_timeout = config.read_timeout();
    let write_timeout = config.write_timeout();
    let mut read_deadline = Instant::now() + read_timeout;
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval(),
        config.heartbeat_interval(),
    );

    let reason = loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(message)) => match SocketMessage::from(message) {
                    SocketMessage::Pong(_) => {
                        trace!(id = %connection.id(), "heartbeat answered");
                        read_deadline = Instant::now() + read_timeout;
                    }
                    SocketMessage::Ping(data) => {
                        if write_frame(&mut socket, SocketMessage::Pong(data), write_timeout)
                            .await
                            .is_err()
                        {
                            break "ping reply failed";
                        }
                    }
                    SocketMessage::Text(text) => {
                        if text.len() > config.max_frame_bytes {
                            warn!(id = %connection.id(), size = text.len(), "inbound frame exceeds size cap");
                            break "oversized frame";
                        }
                        if router.protocol().read_kind() == FrameKind::Text {
                            router.dispatch(&connection, text.as_bytes());
                        } else {
                            trace!(id = %connection.id(), "ignoring text frame on binary protocol");
                        }
                    }
                    SocketMessage::Binary(data) => {
                        if data.len() > config.max_frame_bytes {
                            warn!(id = %connection.id(), size = data.len(), "inbound frame exceeds size cap");
                            break "oversized frame";
                        }
                        if router.protocol().read_kind() == FrameKind::Binary {
                            router.dispatch(&connection, &data);
                        } else {
                            trace!(id = %connection.id(), "ignoring binary frame on text protocol");
                        }
                    }
                    SocketMessage::Close(_) => break "peer closed",
                },
                Some(Err(error)) => {
                    debug!(id = %connection.id(), %error, "transport read failed");
                    break "transport error";
                }
                None => break "stream ended",
            },

            _ = sleep_until(read_deadline) => break "read deadline exceeded",

            queued = outbound.recv() => match queued {
                Some(message) => {
                    if write_frame(&mut socket, message, write_timeout).await.is_err() {
                        break "write failed";
                    }
                }
                None => {
                    let _ = write_frame(&mut socket, SocketMessage::close(), write_timeout).await;
                    break "outbound queue closed";
                }
            },

            _ = heartbeat.tick(), if router.heartbeat_enabled() => {
                if write_frame(&mut socket, SocketMessage::ping(), write_timeout)
                    .await
                    .is_err()
                {
                    break "heartbeat failed";
                }
            }

            _ = connection.closed() => {
                let _ = write_frame(&mut socket, SocketMessage::close(), write_timeout).await;
                break "closed locally";
            }
        }
    };

    debug!(id = %connection.id(), reason, "connection loop finished");
    drop(socket);
    hub.unregister(&connection);
    router.invoke_close(&connection);
    info!(id = %connection.id(), "connection torn down");
}

async fn write_frame<S>(
    socket: &mut WebSocketStream<S>,
    message: SocketMessage,
    deadline: Duration,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(deadline, socket.send(message.into())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            debug!(%error, "frame write failed");
            Err(())
        }
        Err(_) => {
            error!("frame write exceeded deadline");
            Err(())
        }
    }
}
