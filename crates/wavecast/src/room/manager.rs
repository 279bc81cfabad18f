//! The room manager.
//!
//! Owns the name→room table and every connection's membership record, and is
//! the single writer that keeps both sides of the mapping consistent. Rooms
//! are reference-counted: created lazily on first join, destroyed when the
//! count returns to zero, so concurrent joins and leaves from many
//! connection tasks can never destroy a room while a join is in flight —
//! every mutation is serialized through the manager's own command loop.

use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::room::room::{Eviction, Room};
use crate::room::types::{ConnectionOptions, RoomEvent};
use crate::router::Router;
use crate::types::ConnectionId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

type RoomHook = Arc<dyn Fn(&str) + Send + Sync>;

enum ManagerCommand {
    Join {
        name: String,
        connection: Connection,
    },
    Leave {
        name: String,
        connection: Connection,
    },
    LeaveAll {
        connection: Connection,
    },
    Send {
        name: String,
        data: Vec<u8>,
    },
    SetOptions {
        connection: Connection,
        options: ConnectionOptions,
        overwrite: bool,
    },
    Destroy {
        name: String,
    },
    Hook {
        event: RoomEvent,
        hook: RoomHook,
    },
    Rooms(oneshot::Sender<Vec<String>>),
    Lookup {
        name: String,
        reply: oneshot::Sender<Option<Room>>,
    },
    Memberships {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stop,
}

/// Handle to a running room manager task.
#[derive(Clone)]
pub struct RoomManager {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    router: Arc<Router>,
}

impl RoomManager {
    /// Start the manager task. The router supplies the protocol used by
    /// [`emit`](Self::emit).
    pub fn new(router: Arc<Router>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (evictions, eviction_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, eviction_rx, evictions));
        Self { commands, router }
    }

    /// Join the named room, creating it on first join.
    pub fn join(&self, name: impl Into<String>, connection: &Connection) {
        let _ = self.commands.send(ManagerCommand::Join {
            name: name.into(),
            connection: connection.clone(),
        });
    }

    /// Leave the named room. A leave for a room the connection never joined
    /// is a no-op.
    pub fn leave(&self, name: impl Into<String>, connection: &Connection) {
        let _ = self.commands.send(ManagerCommand::Leave {
            name: name.into(),
            connection: connection.clone(),
        });
    }

    /// Leave every joined room and drop the membership record. Call this
    /// from the close hook so counts stay accurate across disconnects.
    pub fn leave_all(&self, connection: &Connection) {
        let _ = self.commands.send(ManagerCommand::LeaveAll {
            connection: connection.clone(),
        });
    }

    /// Encode an event with the router's protocol and broadcast it to the
    /// named room. Silently dropped when the room does not exist.
    pub fn emit<T: Serialize>(&self, name: &str, event: &str, value: &T) {
        let protocol = self.router.protocol();
        let frame = serde_json::to_value(value)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
            .and_then(|value| protocol.marshal(&value))
            .and_then(|payload| protocol.pack(event, &payload));
        match frame {
            Ok(frame) => self.send(name, frame),
            Err(error) => debug!(room = name, event, %error, "dropping unencodable emit"),
        }
    }

    /// Broadcast pre-encoded wire bytes to the named room.
    pub fn send(&self, name: impl Into<String>, data: Vec<u8>) {
        let _ = self.commands.send(ManagerCommand::Send {
            name: name.into(),
            data,
        });
    }

    /// OR (or replace, with `overwrite`) the connection's option bits,
    /// creating its membership record if needed.
    pub fn set_options(&self, connection: &Connection, options: ConnectionOptions, overwrite: bool) {
        let _ = self.commands.send(ManagerCommand::SetOptions {
            connection: connection.clone(),
            options,
            overwrite,
        });
    }

    /// Force every member out of the named room, tearing it down once empty.
    pub fn destroy(&self, name: impl Into<String>) {
        let _ = self.commands.send(ManagerCommand::Destroy { name: name.into() });
    }

    /// Register a lifecycle hook, fired with the room name. Hooks run on
    /// their own task and never block the manager.
    pub fn on<F>(&self, event: RoomEvent, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let _ = self.commands.send(ManagerCommand::Hook {
            event,
            hook: Arc::new(hook),
        });
    }

    /// Names of all rooms currently in the table.
    pub async fn rooms(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ManagerCommand::Rooms(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Handle to the named room, if it exists.
    pub async fn room(&self, name: &str) -> Option<Room> {
        let (reply, rx) = oneshot::channel();
        let command = ManagerCommand::Lookup {
            name: name.to_string(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Names of the rooms the connection currently belongs to.
    pub async fn memberships(&self, connection: &Connection) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let command = ManagerCommand::Memberships {
            connection_id: connection.id(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the manager and every room it owns.
    pub fn stop(&self) {
        let _ = self.commands.send(ManagerCommand::Stop);
    }
}

struct Managed {
    room: Room,
    count: usize,
}

struct Membership {
    connection: Connection,
    rooms: HashSet<String>,
    options: ConnectionOptions,
}

impl Membership {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            rooms: HashSet::new(),
            options: ConnectionOptions::NONE,
        }
    }
}

struct ManagerState {
    rooms: HashMap<String, Managed>,
    members: HashMap<ConnectionId, Membership>,
    created: Option<RoomHook>,
    removed: Option<RoomHook>,
    evictions: mpsc::UnboundedSender<Eviction>,
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<ManagerCommand>,
    mut eviction_rx: mpsc::UnboundedReceiver<Eviction>,
    evictions: mpsc::UnboundedSender<Eviction>,
) {
    let mut state = ManagerState {
        rooms: HashMap::new(),
        members: HashMap::new(),
        created: None,
        removed: None,
        evictions,
    };

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ManagerCommand::Stop) | None => break,
                Some(command) => state.handle(command),
            },
            Some(eviction) = eviction_rx.recv() => {
                state.leave(&eviction.room, eviction.connection.id(), true);
            }
        }
    }

    for (_, managed) in state.rooms.drain() {
        managed.room.stop();
    }
    debug!("room manager stopped");
}

impl ManagerState {
    fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Join { name, connection } => self.join(name, connection),
            ManagerCommand::Leave { name, connection } => {
                self.leave(&name, connection.id(), false)
            }
            ManagerCommand::LeaveAll { connection } => self.leave_all(connection.id()),
            ManagerCommand::Send { name, data } => self.send(&name, data),
            ManagerCommand::SetOptions {
                connection,
                options,
                overwrite,
            } => self.set_options(connection, options, overwrite),
            ManagerCommand::Destroy { name } => self.destroy(&name),
            ManagerCommand::Hook { event, hook } => match event {
                RoomEvent::Created => self.created = Some(hook),
                RoomEvent::Removed => self.removed = Some(hook),
            },
            ManagerCommand::Rooms(reply) => {
                let _ = reply.send(self.rooms.keys().cloned().collect());
            }
            ManagerCommand::Lookup { name, reply } => {
                let _ = reply.send(self.rooms.get(&name).map(|m| m.room.clone()));
            }
            ManagerCommand::Memberships {
                connection_id,
                reply,
            } => {
                let names = self
                    .members
                    .get(&connection_id)
                    .map(|record| record.rooms.iter().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(names);
            }
            ManagerCommand::Stop => unreachable!("stop is handled by the loop"),
        }
    }

    fn join(&mut self, name: String, connection: Connection) {
        let record = self
            .members
            .entry(connection.id())
            .or_insert_with(|| Membership::new(connection.clone()));
        if !record.rooms.insert(name.clone()) {
            trace!(room = %name, id = %connection.id(), "join ignored, already a member");
            return;
        }

        match self.rooms.get_mut(&name) {
            Some(managed) => {
                managed.count += 1;
                managed.room.join(&connection);
            }
            None => {
                let room = Room::managed(name.clone(), self.evictions.clone());
                room.join(&connection);
                self.rooms.insert(name.clone(), Managed { room, count: 1 });
                info!(room = %name, "room created");
                self.fire(RoomEvent::Created, &name);
            }
        }
    }

    /// Shared leave path for explicit leaves, leave-all, destroys and
    /// broadcast evictions. `room_already_left` skips the redundant removal
    /// when the room itself reported the departure.
    fn leave(&mut self, name: &str, connection_id: ConnectionId, room_already_left: bool) {
        if !self.rooms.contains_key(name) {
            return;
        }
        let Some(record) = self.members.get_mut(&connection_id) else {
            return;
        };
        if !record.rooms.remove(name) {
            return;
        }
        let connection = record.connection.clone();
        let auto_close = record.rooms.is_empty()
            && record.options.contains(ConnectionOptions::CLOSE_ON_LAST_LEAVE);

        let mut emptied = false;
        if let Some(managed) = self.rooms.get_mut(name) {
            if !room_already_left {
                managed.room.leave(&connection);
            }
            managed.count = managed.count.saturating_sub(1);
            emptied = managed.count == 0;
        }
        if emptied {
            if let Some(managed) = self.rooms.remove(name) {
                managed.room.stop();
            }
            info!(room = %name, "room removed");
            self.fire(RoomEvent::Removed, name);
        }

        if auto_close {
            debug!(id = %connection.id(), "closing connection after last leave");
            self.members.remove(&connection_id);
            connection.close();
        }
    }

    fn leave_all(&mut self, connection_id: ConnectionId) {
        let names: Vec<String> = match self.members.get(&connection_id) {
            Some(record) => record.rooms.iter().cloned().collect(),
            None => return,
        };
        for name in names {
            self.leave(&name, connection_id, false);
        }
        self.members.remove(&connection_id);
    }

    fn send(&self, name: &str, data: Vec<u8>) {
        match self.rooms.get(name) {
            Some(managed) => managed.room.broadcast(data),
            None => debug!(room = name, "dropping broadcast for unknown room"),
        }
    }

    fn set_options(&mut self, connection: Connection, options: ConnectionOptions, overwrite: bool) {
        let record = self
            .members
            .entry(connection.id())
            .or_insert_with(|| Membership::new(connection));
        if overwrite {
            record.options = options;
        } else {
            record.options.insert(options);
        }
    }

    fn destroy(&mut self, name: &str) {
        let members: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|(_, record)| record.rooms.contains(name))
            .map(|(id, _)| *id)
            .collect();
        for connection_id in members {
            self.leave(name, connection_id, false);
        }
        // A room can linger with no membership records only if it was never
        // joined through this manager; reclaim it anyway.
        if let Some(managed) = self.rooms.remove(name) {
            managed.room.stop();
            info!(room = name, "room removed");
            self.fire(RoomEvent::Removed, name);
        }
    }

    fn fire(&self, event: RoomEvent, name: &str) {
        let hook = match event {
            RoomEvent::Created => self.created.clone(),
            RoomEvent::Removed => self.removed.clone(),
        };
        if let Some(hook) = hook {
            let name = name.to_string();
            tokio::spawn(async move { hook(&name) });
        }
    }
}
