//! End-to-end tests over in-memory duplex streams.
//!
//! Each test performs a real WebSocket client handshake against
//! `SocketServer::serve_stream`, so the upgrade path, the connection actor
//! and the routing layer are all exercised together.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use wavecast::{Connection, ConnectionOptions, RoomManager, Router, SocketConfig, SocketServer};

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
struct Chat {
    text: String,
}

type ClientSocket = WebSocketStream<DuplexStream>;

async fn connect(server: &SocketServer) -> ClientSocket {
    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    let server = server.clone();
    tokio::spawn(async move { server.serve_stream(server_end).await });

    let (socket, _response) = tokio_tungstenite::client_async("ws://localhost/ws", client_end)
        .await
        .expect("client handshake should succeed");
    socket
}

/// Read frames until the next text frame, skipping heartbeat traffic.
async fn next_text(socket: &mut ClientSocket) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a text frame")
            .expect("stream ended unexpectedly")
            .expect("transport error");
        match frame {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn typed_event_round_trip() {
    let router = Arc::new(Router::new());
    router.on("chat.message", |conn: &Connection, message: Chat| {
        conn.emit("chat.echo", &message);
    });
    let server = SocketServer::new(router);

    let mut client = connect(&server).await;
    client
        .send(Message::Text("chat.message {\"text\":\"hi\"}".to_string()))
        .await
        .unwrap();

    let frame = next_text(&mut client).await;
    let (event, payload) = frame.split_once(' ').expect("framed reply");
    assert_eq!(event, "chat.echo");
    assert_eq!(
        serde_json::from_str::<Chat>(payload).unwrap(),
        Chat {
            text: "hi".to_string()
        }
    );
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let router = Arc::new(Router::new());
    router.on("echo", |conn: &Connection, message: Chat| {
        conn.emit("echo.reply", &message);
    });
    let server = SocketServer::new(router);

    let mut client = connect(&server).await;
    client
        .send(Message::Text("no-separator".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text("echo {\"text\":42}".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text("unknown.event {}".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text("echo {\"text\":\"still alive\"}".to_string()))
        .await
        .unwrap();

    let frame = next_text(&mut client).await;
    assert_eq!(frame, "echo.reply {\"text\":\"still alive\"}");
}

#[tokio::test]
async fn connect_and_close_hooks_fire_once() {
    let router = Arc::new(Router::new());
    let connects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let counter = connects.clone();
    router.on_connect(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = closes.clone();
    router.on_close(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let server = SocketServer::new(router);
    let mut client = connect(&server).await;

    wait_for(|| connects.load(Ordering::SeqCst) == 1, "the connect hook").await;
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    client.close(None).await.unwrap();
    wait_for(|| closes.load(Ordering::SeqCst) == 1, "the close hook").await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    for _ in 0..200 {
        if server.hub().count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for the hub to forget the connection");
}

#[tokio::test]
async fn hub_broadcast_reaches_every_client() {
    let router = Arc::new(Router::new());
    let server = SocketServer::new(router);

    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    // Both connections must be registered before the broadcast fans out.
    for _ in 0..200 {
        if server.hub().count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.hub().count().await, 2);

    server.broadcast_emit("news.flash", &Chat {
        text: "extra".to_string(),
    });

    assert_eq!(next_text(&mut first).await, "news.flash {\"text\":\"extra\"}");
    assert_eq!(next_text(&mut second).await, "news.flash {\"text\":\"extra\"}");
}

#[tokio::test]
async fn rooms_route_events_between_clients() {
    #[derive(Serialize, Deserialize)]
    struct JoinRequest {
        room: String,
    }

    let router = Arc::new(Router::new());
    let rooms = RoomManager::new(router.clone());

    let manager = rooms.clone();
    router.on("room.join", move |conn: &Connection, request: JoinRequest| {
        manager.join(request.room, conn);
    });
    let manager = rooms.clone();
    router.on("room.say", move |_conn: &Connection, message: Chat| {
        manager.emit("lobby", "room.message", &message);
    });
    let manager = rooms.clone();
    router.on_close(move |conn| manager.leave_all(conn));

    let server = SocketServer::new(router);
    let mut speaker = connect(&server).await;
    let mut listener = connect(&server).await;

    for client in [&mut speaker, &mut listener] {
        client
            .send(Message::Text("room.join {\"room\":\"lobby\"}".to_string()))
            .await
            .unwrap();
    }

    // Wait until both joins landed before speaking.
    for _ in 0..200 {
        if let Some(room) = rooms.room("lobby").await {
            if room.members().await.len() == 2 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    speaker
        .send(Message::Text("room.say {\"text\":\"hello room\"}".to_string()))
        .await
        .unwrap();

    assert_eq!(
        next_text(&mut speaker).await,
        "room.message {\"text\":\"hello room\"}"
    );
    assert_eq!(
        next_text(&mut listener).await,
        "room.message {\"text\":\"hello room\"}"
    );
}

#[tokio::test]
async fn disallowed_origin_is_rejected() {
    let router = Arc::new(Router::new());
    router.allow_origin("http://app.example");
    let server = SocketServer::new(router);

    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve_stream(server_end).await });
    }

    let mut request = "ws://localhost/ws".into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example"));

    let result = tokio_tungstenite::client_async(request, client_end).await;
    assert!(result.is_err(), "handshake should be refused");
}

#[tokio::test]
async fn allowed_origin_is_admitted() {
    let router = Arc::new(Router::new());
    router.allow_origin("http://app.example");
    let server = SocketServer::new(router);

    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve_stream(server_end).await });
    }

    let mut request = "ws://localhost/ws".into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://app.example"));

    assert!(tokio_tungstenite::client_async(request, client_end)
        .await
        .is_ok());
}

#[tokio::test]
async fn handshake_hook_can_reject_the_upgrade() {
    let router = Arc::new(Router::new());
    router.on_handshake(|handshake| handshake.header("x-api-key") == Some("sesame"));
    let server = SocketServer::new(router);

    // Without the key the upgrade is refused.
    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve_stream(server_end).await });
    }
    assert!(
        tokio_tungstenite::client_async("ws://localhost/ws", client_end)
            .await
            .is_err()
    );

    // With the key it goes through.
    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve_stream(server_end).await });
    }
    let mut request = "ws://localhost/ws".into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-api-key", HeaderValue::from_static("sesame"));
    assert!(tokio_tungstenite::client_async(request, client_end)
        .await
        .is_ok());
}

#[tokio::test]
async fn server_sends_heartbeat_pings() {
    let config = SocketConfig {
        read_timeout_secs: 10,
        heartbeat_interval_secs: 2,
        write_timeout_secs: 1,
        ..SocketConfig::default()
    };
    let server = SocketServer::with_config(Arc::new(Router::new()), config);

    let mut client = connect(&server).await;
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("expected a heartbeat within the interval")
        .expect("stream ended unexpectedly")
        .expect("transport error");
    assert!(matches!(frame, Message::Ping(_)));
}

#[tokio::test]
async fn close_on_last_leave_tears_the_connection_down() {
    #[derive(Serialize, Deserialize)]
    struct JoinRequest {
        room: String,
    }

    let router = Arc::new(Router::new());
    let rooms = RoomManager::new(router.clone());

    let manager = rooms.clone();
    router.on("room.join", move |conn: &Connection, request: JoinRequest| {
        manager.set_options(conn, ConnectionOptions::CLOSE_ON_LAST_LEAVE, false);
        manager.join(request.room, conn);
    });
    let manager = rooms.clone();
    router.on("room.leave", move |conn: &Connection, request: JoinRequest| {
        manager.leave(request.room, conn);
    });

    let server = SocketServer::new(router);
    let mut client = connect(&server).await;

    client
        .send(Message::Text("room.join {\"room\":\"solo\"}".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text("room.leave {\"room\":\"solo\"}".to_string()))
        .await
        .unwrap();

    // The manager closes the connection, so the client sees a close frame.
    let deadline = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "expected the server to close the socket");
}
