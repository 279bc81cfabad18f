//! The accept loop and upgrade edge.
//!
//! Everything below the upgraded frame stream is tungstenite's job; this
//! module only decides whether an upgrade is allowed (origin allow-list,
//! handshake hook) and hands accepted sockets to the connection actor.

use crate::config::SocketConfig;
use crate::connection::{self, Connection};
use crate::error::SocketResult;
use crate::hub::Hub;
use crate::router::Router;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Read-only view of an upgrade request, handed to the handshake hook.
#[derive(Debug, Clone)]
pub struct Handshake {
    uri: String,
    headers: Vec<(String, String)>,
}

impl Handshake {
    fn from_request(request: &Request) -> Self {
        Self {
            uri: request.uri().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }
}

/// Accepts WebSocket connections and wires them to a router and a hub.
#[derive(Clone)]
pub struct SocketServer {
    router: Arc<Router>,
    hub: Hub,
    config: SocketConfig,
}

impl SocketServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_config(router, SocketConfig::default())
    }

    pub fn with_config(router: Arc<Router>, config: SocketConfig) -> Self {
        Self {
            router,
            hub: Hub::spawn(),
            config,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Encode an event with the router's protocol and broadcast it to every
    /// registered connection.
    pub fn broadcast_emit<T: Serialize>(&self, event: &str, value: &T) {
        let protocol = self.router.protocol();
        let frame = serde_json::to_value(value)
            .map_err(|e| crate::error::ProtocolError::Encode(e.to_string()))
            .and_then(|value| protocol.marshal(&value))
            .and_then(|payload| protocol.pack(event, &payload));
        match frame {
            Ok(frame) => self.hub.broadcast(frame),
            Err(error) => debug!(event, %error, "dropping unencodable broadcast"),
        }
    }

    /// Bind the address and serve upgrades until the listener fails.
    pub async fn listen(&self, addr: &str) -> SocketResult<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "listening for websocket connections");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted tcp connection");
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_stream(stream).await });
                }
                Err(error) => warn!(%error, "tcp accept failed"),
            }
        }
    }

    /// Upgrade one duplex byte stream and run its connection to completion.
    ///
    /// Rejections happen before the connection exists: a disallowed origin
    /// or a failed handshake hook answers 403, and malformed upgrades are
    /// refused by the handshake layer itself.
    pub async fn serve_stream<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_frame_bytes);
        ws_config.max_frame_size = Some(self.config.max_frame_bytes);

        let router = self.router.clone();
        let callback = {
            let router = router.clone();
            move |request: &Request, response: Response| {
                let handshake = Handshake::from_request(request);
                if !router.origin_allowed(handshake.origin()) {
                    warn!(origin = ?handshake.origin(), "rejecting upgrade from disallowed origin");
                    return Err(forbidden("origin not allowed"));
                }
                if !router.verify_handshake(&handshake) {
                    warn!(uri = %handshake.uri(), "handshake verification failed");
                    return Err(forbidden("handshake rejected"));
                }
                Ok(response)
            }
        };

        let socket =
            match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
                .await
            {
                Ok(socket) => socket,
                Err(error) => {
                    debug!(%error, "websocket upgrade failed");
                    return;
                }
            };

        let (conn, outbound) = Connection::new(router.clone(), self.config.send_queue_size);
        self.hub.register(&conn);
        info!(id = %conn.id(), "connection established");
        router.invoke_connect(&conn);

        connection::run(conn, socket, outbound, self.hub.clone(), self.config.clone()).await;
    }
}

fn forbidden(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}
