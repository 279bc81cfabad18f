//! # wavecast
//!
//! A real-time event broker over WebSockets:
//! - one actor per connection, with heartbeat and backpressure discipline
//! - a process-wide hub for global broadcast with eviction of slow consumers
//! - dynamically created, reference-counted rooms with multi-room membership
//! - typed event routing over a pluggable wire protocol (JSON by default)
//!
//! Every connection, room, the hub and the room manager is an independent
//! sequential task; all coordination is message passing, never shared
//! mutable state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wavecast::{Router, RoomManager, SocketServer};
//!
//! #[derive(serde::Deserialize, serde::Serialize)]
//! struct Chat { text: String }
//!
//! #[tokio::main]
//! async fn main() -> wavecast::SocketResult<()> {
//!     let router = Arc::new(Router::new());
//!     let rooms = RoomManager::new(router.clone());
//!
//!     let manager = rooms.clone();
//!     router.on("chat.message", move |conn: &wavecast::Connection, msg: Chat| {
//!         manager.emit("lobby", "chat.message", &msg);
//!         conn.emit("chat.ack", &serde_json::json!({ "ok": true }));
//!     });
//!
//!     let manager = rooms.clone();
//!     router.on_close(move |conn| manager.leave_all(conn));
//!
//!     SocketServer::new(router).listen("127.0.0.1:8080").await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod room;
pub mod router;
pub mod server;
pub mod types;

pub use config::SocketConfig;
pub use connection::Connection;
pub use error::{ConfigError, EnqueueError, ProtocolError, SocketError, SocketResult};
pub use hub::Hub;
pub use protocol::{JsonProtocol, Protocol};
pub use room::{ConnectionOptions, Room, RoomEvent, RoomManager};
pub use router::Router;
pub use server::{Handshake, SocketServer};
pub use types::{ConnectionId, FrameKind, SocketMessage};
