use std::collections::{HashMap, HashSet};
use std::num::Wrapping;

use crate::message::{ConnectionId, Identity, Participant, SessionId, UserId};

/// One live transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub session_id: Option<SessionId>,
    pub is_host: bool,
}

impl Connection {
    pub fn participant(&self) -> Participant {
        Participant {
            connection_id: self.id,
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRoom {
    admitted: HashSet<ConnectionId>,
    host: Option<ConnectionId>,
    auto_admit: bool,
}

impl SessionRoom {
    pub fn host(&self) -> Option<ConnectionId> {
        self.host
    }

    pub fn auto_admit(&self) -> bool {
        self.auto_admit
    }

    pub fn set_auto_admit(&mut self, enabled: bool) {
        self.auto_admit = enabled;
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.admitted.contains(connection_id)
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

/// What happened when a connection left its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session_id: SessionId,
    pub was_host: bool,
    pub room_removed: bool,
}

/// Live connections and the rooms they have been admitted to.
///
/// Nothing here survives a restart; clients reconnect and rejoin.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connection_id_source: Wrapping<ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<SessionId, SessionRoom>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connection_id_source: Wrapping(0),
            connections: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    pub fn register(&mut self, identity: Identity) -> ConnectionId {
        let connection_id = self.new_connection_id();
        log::info!(
            "Connection {} registered for {} ({})",
            connection_id,
            identity.id,
            identity.role
        );
        self.connections.insert(
            connection_id,
            Connection {
                id: connection_id,
                user_id: identity.id,
                display_name: identity.display_name,
                session_id: None,
                is_host: false,
            },
        );
        connection_id
    }

    pub fn lookup(&self, connection_id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    pub fn rename(&mut self, connection_id: &ConnectionId, display_name: &str) {
        if display_name.trim().is_empty() {
            return;
        }
        if let Some(connection) = self.connections.get_mut(connection_id) {
            connection.display_name = display_name.trim().to_owned();
        }
    }

    pub fn room(&self, session_id: &str) -> Option<&SessionRoom> {
        self.rooms.get(session_id)
    }

    pub fn room_mut(&mut self, session_id: &str) -> Option<&mut SessionRoom> {
        self.rooms.get_mut(session_id)
    }

    /// Rooms are created on the first join attempt for a session.
    pub fn ensure_room(&mut self, session_id: &str) -> &mut SessionRoom {
        self.rooms.entry(session_id.to_owned()).or_default()
    }

    /// Drops a room nobody has been admitted to.
    pub fn remove_room_if_empty(&mut self, session_id: &str) -> bool {
        if self.rooms.get(session_id).map_or(false, |r| r.is_empty()) {
            self.rooms.remove(session_id);
            true
        } else {
            false
        }
    }

    /// Admits the connection into `session_id`, leaving any previous room.
    ///
    /// Host intent only takes effect when the room's host slot is free.
    /// Returns whether the connection ended up as host, or `None` if it is unknown.
    pub fn set_session(
        &mut self,
        connection_id: &ConnectionId,
        session_id: &str,
        is_host: bool,
    ) -> Option<bool> {
        let current = self.connections.get(connection_id)?.session_id.clone();
        if current.as_deref().map_or(false, |s| s != session_id) {
            self.clear_session(connection_id);
        }

        let room = self.rooms.entry(session_id.to_owned()).or_default();
        room.admitted.insert(*connection_id);
        let claimed = room.host == Some(*connection_id) || (is_host && room.host.is_none());
        if claimed {
            room.host = Some(*connection_id);
        }

        let connection = self.connections.get_mut(connection_id)?;
        connection.session_id = Some(session_id.to_owned());
        connection.is_host = claimed;
        log::info!(
            "Connection {} joined session {}{}",
            connection_id,
            session_id,
            if claimed { " as host" } else { "" }
        );
        Some(claimed)
    }

    pub fn clear_session(&mut self, connection_id: &ConnectionId) -> Option<Departure> {
        let connection = self.connections.get_mut(connection_id)?;
        let session_id = connection.session_id.take()?;
        connection.is_host = false;

        let mut was_host = false;
        if let Some(room) = self.rooms.get_mut(&session_id) {
            room.admitted.remove(connection_id);
            if room.host == Some(*connection_id) {
                room.host = None;
                room.auto_admit = false;
                was_host = true;
            }
        }
        let room_removed = self.remove_room_if_empty(&session_id);
        log::info!("Connection {} left session {}", connection_id, session_id);

        Some(Departure {
            session_id,
            was_host,
            room_removed,
        })
    }

    pub fn unregister(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Option<(Connection, Option<Departure>)> {
        let departure = self.clear_session(connection_id);
        let connection = self.connections.remove(connection_id)?;
        log::info!("Connection {} unregistered", connection_id);
        Some((connection, departure))
    }

    /// Admitted connections of a session, in ascending id order.
    pub fn members_of(&self, session_id: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(session_id)
            .map(|r| r.admitted.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn new_connection_id(&mut self) -> ConnectionId {
        loop {
            self.connection_id_source += Wrapping(1);
            let candidate = self.connection_id_source.0;
            if candidate != 0 && !self.connections.contains_key(&candidate) {
                break candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity {
            id: format!("user-{}", name),
            display_name: name.into(),
            role: "candidate".into(),
        }
    }

    #[test]
    fn it_remove_session_when_all_connections_disconnect() {
        let mut registry = ConnectionRegistry::new();
        let connection_id = registry.register(identity("a"));
        registry.set_session(&connection_id, "S1", false);
        let (_, departure) = registry.unregister(&connection_id).expect("registered");
        assert!(departure.expect("was joined").room_removed);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn it_gives_host_slot_to_first_claimant_only() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.register(identity("a"));
        let second = registry.register(identity("b"));
        assert_eq!(registry.set_session(&first, "S1", true), Some(true));
        assert_eq!(registry.set_session(&second, "S1", true), Some(false));
        assert_eq!(registry.room("S1").and_then(|r| r.host()), Some(first));
        assert_eq!(registry.members_of("S1"), vec![first, second]);
    }

    #[test]
    fn it_clears_host_and_auto_admit_when_host_leaves() {
        let mut registry = ConnectionRegistry::new();
        let host = registry.register(identity("h"));
        let guest = registry.register(identity("g"));
        registry.set_session(&host, "S1", true);
        registry.set_session(&guest, "S1", false);
        registry.ensure_room("S1").set_auto_admit(true);

        let departure = registry.clear_session(&host).expect("joined");
        assert!(departure.was_host);
        assert!(!departure.room_removed);
        let room = registry.room("S1").expect("guest remains");
        assert_eq!(room.host(), None);
        assert!(!room.auto_admit());
        assert!(room.contains(&guest));
    }

    #[test]
    fn it_moves_connection_between_rooms() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.register(identity("a"));
        registry.set_session(&a, "S1", false);
        registry.set_session(&a, "S2", false);
        assert!(registry.room("S1").is_none());
        assert_eq!(registry.members_of("S2"), vec![a]);
        assert_eq!(
            registry.lookup(&a).and_then(|c| c.session_id.clone()),
            Some("S2".to_owned())
        );
    }

    #[test]
    fn it_ignores_unknown_connections() {
        let mut registry = ConnectionRegistry::new();
        assert_eq!(registry.set_session(&42, "S1", true), None);
        assert!(registry.unregister(&42).is_none());
        assert!(registry.members_of("S1").is_empty());
    }
}
