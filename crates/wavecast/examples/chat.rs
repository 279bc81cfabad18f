//! A small chat server.
//!
//! Connect with any WebSocket client and speak the default text protocol:
//!
//! ```text
//! room.join {"room":"lobby"}
//! chat.message {"room":"lobby","text":"hello"}
//! room.leave {"room":"lobby"}
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wavecast::{Connection, RoomEvent, RoomManager, Router, SocketConfig, SocketServer};

#[derive(Deserialize)]
struct RoomRequest {
    room: String,
}

#[derive(Deserialize, Serialize)]
struct ChatMessage {
    room: String,
    text: String,
}

#[tokio::main]
async fn main() -> wavecast::SocketResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wavecast=debug".into()),
        )
        .init();

    let router = Arc::new(Router::new());
    let rooms = RoomManager::new(router.clone());

    rooms.on(RoomEvent::Created, |name| tracing::info!(room = name, "room opened"));
    rooms.on(RoomEvent::Removed, |name| tracing::info!(room = name, "room closed"));

    let manager = rooms.clone();
    router.on("room.join", move |conn: &Connection, request: RoomRequest| {
        manager.join(request.room, conn);
        conn.emit("room.joined", &serde_json::json!({ "ok": true }));
    });

    let manager = rooms.clone();
    router.on("room.leave", move |conn: &Connection, request: RoomRequest| {
        manager.leave(request.room, conn);
    });

    let manager = rooms.clone();
    router.on("chat.message", move |_conn: &Connection, message: ChatMessage| {
        manager.emit(&message.room, "chat.message", &message);
    });

    // Memberships must not outlive the socket.
    let manager = rooms.clone();
    router.on_close(move |conn| manager.leave_all(conn));

    let config = SocketConfig::from_env()?;
    SocketServer::with_config(router, config)
        .listen("127.0.0.1:8080")
        .await
}
