use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;

use system::{ConnectionId, ConnectionRegistry, Notification, Recipient, ServerEvent};

pub type ConnectionTx = tokio::sync::mpsc::Sender<ServerEvent>;

/// Outbound queues of every live connection.
///
/// Delivery never waits: a full queue drops the event, a closed queue marks
/// the connection for disconnect cleanup.
pub struct BroadcastBus {
    connection_txs: HashMap<ConnectionId, ConnectionTx>,
    closed: Vec<ConnectionId>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            connection_txs: HashMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn insert(&mut self, connection_id: ConnectionId, tx: ConnectionTx) {
        self.connection_txs.insert(connection_id, tx);
    }

    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<ConnectionTx> {
        self.connection_txs.remove(connection_id)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connection_txs.contains_key(connection_id)
    }

    pub fn unicast(&mut self, to: &ConnectionId, event: ServerEvent) -> bool {
        let tx = match self.connection_txs.get(to) {
            Some(tx) => tx,
            None => {
                log::debug!("No outbound queue for connection {}", to);
                return false;
            }
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue of connection {} is full, dropping event", to);
                false
            }
            Err(TrySendError::Closed(_)) => {
                if !self.closed.contains(to) {
                    self.closed.push(*to);
                }
                false
            }
        }
    }

    pub fn broadcast_to_room(
        &mut self,
        members: &[ConnectionId],
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) {
        for connection_id in members {
            if Some(*connection_id) != except {
                self.unicast(connection_id, event.clone());
            }
        }
    }

    /// Resolves room recipients against the registry as it is now.
    pub fn deliver(&mut self, notifications: Vec<Notification>, registry: &ConnectionRegistry) {
        for Notification { to, event } in notifications {
            match to {
                Recipient::Connection(connection_id) => {
                    self.unicast(&connection_id, event);
                }
                Recipient::Room { session_id, except } => {
                    let members = registry.members_of(&session_id);
                    self.broadcast_to_room(&members, &event, except);
                }
            }
        }
    }

    /// Connections found closed since the last call.
    pub fn take_closed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closed)
    }
}
