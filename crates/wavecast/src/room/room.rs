//! A single broadcast room.
//!
//! Each room is its own sequential task over a command queue; the [`Room`]
//! handle submits commands and never touches the member set directly.

use crate::connection::Connection;
use crate::types::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Notice sent to the owning manager when a broadcast evicts a member.
pub(crate) struct Eviction {
    pub room: String,
    pub connection: Connection,
}

enum RoomCommand {
    Join(Connection),
    Leave(Connection),
    Broadcast(Vec<u8>),
    Members(oneshot::Sender<Vec<ConnectionId>>),
    Stop,
}

/// Handle to a running room task.
#[derive(Clone)]
pub struct Room {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl Room {
    /// Start a standalone room. Rooms owned by a
    /// [`RoomManager`](super::RoomManager) are created through joins instead.
    pub fn new(name: impl Into<String>) -> Self {
        Self::spawn(name.into(), None)
    }

    pub(crate) fn managed(name: String, evictions: mpsc::UnboundedSender<Eviction>) -> Self {
        Self::spawn(name, Some(evictions))
    }

    fn spawn(name: String, evictions: Option<mpsc::UnboundedSender<Eviction>>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let room = Self {
            name: name.into(),
            commands,
        };
        tokio::spawn(run(room.name.clone(), rx, evictions));
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Joining twice is a no-op.
    pub fn join(&self, connection: &Connection) {
        let _ = self.commands.send(RoomCommand::Join(connection.clone()));
    }

    /// Remove a member. Leaving a room never joined is a no-op.
    pub fn leave(&self, connection: &Connection) {
        let _ = self.commands.send(RoomCommand::Leave(connection.clone()));
    }

    /// Send pre-encoded wire bytes to every member. A member whose queue is
    /// full is removed exactly like an explicit leave.
    pub fn broadcast(&self, data: Vec<u8>) {
        let _ = self.commands.send(RoomCommand::Broadcast(data));
    }

    /// Snapshot of the current member ids.
    pub async fn members(&self) -> Vec<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(RoomCommand::Members(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Terminate the room task unconditionally. The handle is dead afterwards.
    pub fn stop(&self) {
        let _ = self.commands.send(RoomCommand::Stop);
    }
}

async fn run(
    name: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    evictions: Option<mpsc::UnboundedSender<Eviction>>,
) {
    let mut members: HashMap<ConnectionId, Connection> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            RoomCommand::Join(connection) => {
                trace!(room = %name, id = %connection.id(), "member joined");
                members.entry(connection.id()).or_insert(connection);
            }
            RoomCommand::Leave(connection) => {
                if members.remove(&connection.id()).is_some() {
                    trace!(room = %name, id = %connection.id(), "member left");
                }
            }
            RoomCommand::Broadcast(data) => {
                let mut dead = Vec::new();
                for connection in members.values() {
                    if connection.send_raw(data.clone()).is_err() {
                        dead.push(connection.clone());
                    }
                }
                for connection in dead {
                    members.remove(&connection.id());
                    debug!(room = %name, id = %connection.id(), "dropping unresponsive member");
                    if let Some(evictions) = &evictions {
                        let _ = evictions.send(Eviction {
                            room: name.to_string(),
                            connection,
                        });
                    }
                }
            }
            RoomCommand::Members(reply) => {
                let _ = reply.send(members.keys().copied().collect());
            }
            RoomCommand::Stop => break,
        }
    }

    trace!(room = %name, "room task finished");
}
