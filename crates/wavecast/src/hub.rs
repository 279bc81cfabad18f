//! The hub: process-wide registry of live connections.
//!
//! A single owner task holds the live set and applies register, unregister
//! and broadcast commands strictly in order; the [`Hub`] handle only submits
//! commands, so no lock guards the set. A hub is an explicit constructed
//! resource: build one with [`Hub::spawn`] and pass it to whatever creates
//! connections.

use crate::connection::Connection;
use crate::types::ConnectionId;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

enum HubCommand {
    Register(Connection),
    Unregister(Connection),
    Broadcast(Vec<u8>),
    Count(oneshot::Sender<usize>),
    Stop,
}

/// Handle to a running hub task.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Start the owner task and return a handle to it.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { commands }
    }

    /// Add a connection to the live set.
    pub fn register(&self, connection: &Connection) {
        let _ = self.commands.send(HubCommand::Register(connection.clone()));
    }

    /// Remove a connection and close its outbound queue. No-op when the
    /// connection is not registered.
    pub fn unregister(&self, connection: &Connection) {
        let _ = self
            .commands
            .send(HubCommand::Unregister(connection.clone()));
    }

    /// Send pre-encoded wire bytes to every live connection.
    ///
    /// Enqueues are non-blocking; a member whose queue is full is evicted
    /// instead of retried, so one slow consumer never stalls the rest.
    pub fn broadcast(&self, data: Vec<u8>) {
        let _ = self.commands.send(HubCommand::Broadcast(data));
    }

    /// Number of currently registered connections.
    pub async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Count(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Shut the hub down. Registered connections are closed.
    pub fn stop(&self) {
        let _ = self.commands.send(HubCommand::Stop);
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut connections: HashMap<ConnectionId, Connection> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register(connection) => {
                trace!(id = %connection.id(), "registering connection");
                connections.insert(connection.id(), connection);
            }
            HubCommand::Unregister(connection) => {
                remove(&mut connections, &connection);
            }
            HubCommand::Broadcast(data) => {
                let mut dead = Vec::new();
                for connection in connections.values() {
                    if connection.send_raw(data.clone()).is_err() {
                        dead.push(connection.clone());
                    }
                }
                for connection in dead {
                    warn!(id = %connection.id(), "evicting unresponsive connection");
                    remove(&mut connections, &connection);
                }
            }
            HubCommand::Count(reply) => {
                let _ = reply.send(connections.len());
            }
            HubCommand::Stop => break,
        }
    }

    for connection in connections.values() {
        connection.close();
    }
    debug!("hub stopped");
}

fn remove(connections: &mut HashMap<ConnectionId, Connection>, connection: &Connection) {
    if connections.remove(&connection.id()).is_some() {
        trace!(id = %connection.id(), "unregistering connection");
        connection.close();
    }
}
