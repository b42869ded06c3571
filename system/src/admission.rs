//! Host-gated waiting room.
//!
//! Every transition returns the connection's next [`AdmissionState`] together
//! with the notifications it produced. Nothing is delivered from here; the
//! caller routes [`Notification`]s to sockets after the transition is applied,
//! so room recipients are resolved against the post-transition membership.

use std::collections::HashMap;

use chrono::Utc;

use crate::message::{
    AdmissionRequest, AdmissionStatus, ConnectionId, Identity, Participant, ServerEvent,
    SessionId, WaitingEntry,
};
use crate::registry::ConnectionRegistry;

const WAITING_FOR_HOST: &str = "Waiting for the host to join";
const WAITING_FOR_ADMISSION: &str = "Waiting for the host to admit you";
const REJECTED: &str = "The host declined your request to join";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionState {
    Unevaluated,
    Waiting(SessionId),
    Admitted(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Connection(ConnectionId),
    Room {
        session_id: SessionId,
        except: Option<ConnectionId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub to: Recipient,
    pub event: ServerEvent,
}

impl Notification {
    pub fn unicast(connection_id: ConnectionId, event: ServerEvent) -> Self {
        Self {
            to: Recipient::Connection(connection_id),
            event,
        }
    }

    pub fn room(session_id: &str, except: Option<ConnectionId>, event: ServerEvent) -> Self {
        Self {
            to: Recipient::Room {
                session_id: session_id.to_owned(),
                except,
            },
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: AdmissionState,
    pub notifications: Vec<Notification>,
}

impl Transition {
    fn new(state: AdmissionState, notifications: Vec<Notification>) -> Self {
        Self {
            state,
            notifications,
        }
    }

    fn ignored(state: AdmissionState) -> Self {
        Self::new(state, Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct AdmissionController {
    registry: ConnectionRegistry,
    waiting: HashMap<SessionId, Vec<WaitingEntry>>,
    waiting_index: HashMap<ConnectionId, SessionId>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connect(&mut self, identity: Identity) -> ConnectionId {
        self.registry.register(identity)
    }

    pub fn state_of(&self, connection_id: &ConnectionId) -> AdmissionState {
        if let Some(session_id) = self
            .registry
            .lookup(connection_id)
            .and_then(|c| c.session_id.clone())
        {
            AdmissionState::Admitted(session_id)
        } else if let Some(session_id) = self.waiting_index.get(connection_id) {
            AdmissionState::Waiting(session_id.clone())
        } else {
            AdmissionState::Unevaluated
        }
    }

    pub fn waiting_list(&self, session_id: &str) -> Vec<WaitingEntry> {
        self.waiting.get(session_id).cloned().unwrap_or_default()
    }

    pub fn is_host_of(&self, connection_id: &ConnectionId, session_id: &str) -> bool {
        self.registry
            .room(session_id)
            .and_then(|r| r.host())
            .map_or(false, |h| h == *connection_id)
    }

    pub fn request_join(
        &mut self,
        connection_id: ConnectionId,
        session_id: &str,
        display_name: &str,
        is_host: bool,
    ) -> Transition {
        if self.registry.lookup(&connection_id).is_none() {
            return Transition::ignored(AdmissionState::Unevaluated);
        }

        let mut notifications = Vec::new();
        match self.state_of(&connection_id) {
            AdmissionState::Admitted(current) if current == session_id => {
                let as_host = self
                    .registry
                    .lookup(&connection_id)
                    .map_or(false, |c| c.is_host);
                return Transition::new(
                    AdmissionState::Admitted(current),
                    vec![Notification::unicast(
                        connection_id,
                        ServerEvent::AdmissionStatus(AdmissionStatus::admitted(as_host)),
                    )],
                );
            }
            AdmissionState::Waiting(current) if current == session_id => {}
            AdmissionState::Unevaluated => {}
            _ => notifications.extend(self.leave(connection_id).notifications),
        }

        self.registry.rename(&connection_id, display_name);
        let room = self.registry.ensure_room(session_id);
        let host = room.host();
        let auto_admit = room.auto_admit();

        if is_host && host.is_none() {
            self.remove_waiting(&connection_id);
            notifications.extend(self.admit_host(connection_id, session_id));
            return Transition::new(AdmissionState::Admitted(session_id.to_owned()), notifications);
        }
        if is_host {
            log::info!(
                "Connection {} asked to host {} but the slot is taken",
                connection_id,
                session_id
            );
        }

        match host {
            Some(_) if auto_admit => {
                self.remove_waiting(&connection_id);
                notifications.extend(self.admit_participant(connection_id, session_id));
                Transition::new(AdmissionState::Admitted(session_id.to_owned()), notifications)
            }
            Some(host_id) => {
                let (entry, created) = self.enqueue(connection_id, session_id);
                if created {
                    notifications.push(Notification::unicast(
                        host_id,
                        ServerEvent::AdmissionRequest(AdmissionRequest {
                            target_connection_id: entry.connection_id,
                            user_id: entry.user_id.clone(),
                            display_name: entry.display_name.clone(),
                            requested_at: entry.requested_at,
                        }),
                    ));
                }
                notifications.push(self.waiting_room_list(host_id, session_id));
                notifications.push(Notification::unicast(
                    connection_id,
                    ServerEvent::AdmissionStatus(AdmissionStatus::waiting(
                        false,
                        WAITING_FOR_ADMISSION,
                    )),
                ));
                Transition::new(AdmissionState::Waiting(session_id.to_owned()), notifications)
            }
            None => {
                self.enqueue(connection_id, session_id);
                notifications.push(Notification::unicast(
                    connection_id,
                    ServerEvent::AdmissionStatus(AdmissionStatus::waiting(true, WAITING_FOR_HOST)),
                ));
                Transition::new(AdmissionState::Waiting(session_id.to_owned()), notifications)
            }
        }
    }

    /// Host-only. Anything else is ignored without a trace to the caller.
    pub fn admit(
        &mut self,
        actor: ConnectionId,
        session_id: &str,
        target: ConnectionId,
    ) -> Transition {
        if !self.is_host_of(&actor, session_id) || !self.is_waiting_in(&target, session_id) {
            return Transition::ignored(self.state_of(&target));
        }

        self.remove_waiting(&target);
        let mut notifications = self.admit_participant(target, session_id);
        notifications.push(self.waiting_room_list(actor, session_id));
        Transition::new(AdmissionState::Admitted(session_id.to_owned()), notifications)
    }

    pub fn reject(
        &mut self,
        actor: ConnectionId,
        session_id: &str,
        target: ConnectionId,
    ) -> Transition {
        if !self.is_host_of(&actor, session_id) || !self.is_waiting_in(&target, session_id) {
            return Transition::ignored(self.state_of(&target));
        }

        self.remove_waiting(&target);
        self.registry.clear_session(&target);
        self.collect_room(session_id);
        log::info!("Connection {} rejected from {}", target, session_id);
        Transition::new(
            AdmissionState::Unevaluated,
            vec![
                Notification::unicast(
                    target,
                    ServerEvent::AdmissionStatus(AdmissionStatus::refused(REJECTED)),
                ),
                self.waiting_room_list(actor, session_id),
            ],
        )
    }

    /// Only affects joins that happen after the toggle.
    pub fn set_auto_admit(
        &mut self,
        actor: ConnectionId,
        session_id: &str,
        enabled: bool,
    ) -> Vec<Notification> {
        if !self.is_host_of(&actor, session_id) {
            return Vec::new();
        }
        if let Some(room) = self.registry.room_mut(session_id) {
            room.set_auto_admit(enabled);
            log::info!("Session {} auto-admit set to {}", session_id, enabled);
        }
        Vec::new()
    }

    /// Drops whatever admission state the connection holds but keeps it registered.
    pub fn leave(&mut self, connection_id: ConnectionId) -> Transition {
        match self.state_of(&connection_id) {
            AdmissionState::Unevaluated => Transition::ignored(AdmissionState::Unevaluated),
            AdmissionState::Waiting(session_id) => {
                self.remove_waiting(&connection_id);
                let mut notifications = Vec::new();
                if let Some(host_id) = self.registry.room(&session_id).and_then(|r| r.host()) {
                    notifications.push(self.waiting_room_list(host_id, &session_id));
                }
                self.collect_room(&session_id);
                Transition::new(AdmissionState::Unevaluated, notifications)
            }
            AdmissionState::Admitted(session_id) => {
                let participant = match self.participant(&connection_id) {
                    Some(p) => p,
                    None => return Transition::ignored(AdmissionState::Unevaluated),
                };
                let departure = match self.registry.clear_session(&connection_id) {
                    Some(d) => d,
                    None => return Transition::ignored(AdmissionState::Unevaluated),
                };

                let mut notifications = vec![Notification::room(
                    &session_id,
                    Some(connection_id),
                    ServerEvent::UserLeft(participant.clone()),
                )];
                if departure.was_host {
                    notifications.push(Notification::room(
                        &session_id,
                        Some(connection_id),
                        ServerEvent::HostLeft(participant.clone()),
                    ));
                    for entry in self.waiting_list(&session_id) {
                        notifications.push(Notification::unicast(
                            entry.connection_id,
                            ServerEvent::HostLeft(participant.clone()),
                        ));
                    }
                }
                Transition::new(AdmissionState::Unevaluated, notifications)
            }
        }
    }

    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Transition {
        let transition = self.leave(connection_id);
        self.registry.unregister(&connection_id);
        transition
    }

    fn admit_host(&mut self, connection_id: ConnectionId, session_id: &str) -> Vec<Notification> {
        self.registry.set_session(&connection_id, session_id, true);
        let participant = match self.participant(&connection_id) {
            Some(p) => p,
            None => return Vec::new(),
        };

        let mut notifications = vec![
            Notification::unicast(
                connection_id,
                ServerEvent::AdmissionStatus(AdmissionStatus::admitted(true)),
            ),
            Notification::room(
                session_id,
                Some(connection_id),
                ServerEvent::HostJoined(participant.clone()),
            ),
        ];
        for entry in self.waiting_list(session_id) {
            notifications.push(Notification::unicast(
                entry.connection_id,
                ServerEvent::HostJoined(participant.clone()),
            ));
        }
        notifications.push(self.waiting_room_list(connection_id, session_id));
        notifications
    }

    fn admit_participant(
        &mut self,
        connection_id: ConnectionId,
        session_id: &str,
    ) -> Vec<Notification> {
        self.registry.set_session(&connection_id, session_id, false);
        let participant = match self.participant(&connection_id) {
            Some(p) => p,
            None => return Vec::new(),
        };
        vec![
            Notification::unicast(
                connection_id,
                ServerEvent::AdmissionStatus(AdmissionStatus::admitted(false)),
            ),
            Notification::room(
                session_id,
                Some(connection_id),
                ServerEvent::UserJoined(participant),
            ),
        ]
    }

    /// Returns the entry and whether it is new. An existing entry keeps its place.
    fn enqueue(&mut self, connection_id: ConnectionId, session_id: &str) -> (WaitingEntry, bool) {
        let (user_id, display_name) = self
            .registry
            .lookup(&connection_id)
            .map(|c| (c.user_id.clone(), c.display_name.clone()))
            .unwrap_or_default();
        let queue = self.waiting.entry(session_id.to_owned()).or_default();

        if let Some(existing) = queue.iter_mut().find(|e| e.connection_id == connection_id) {
            existing.display_name = display_name;
            return (existing.clone(), false);
        }

        let entry = WaitingEntry {
            connection_id,
            user_id,
            display_name,
            requested_at: Utc::now(),
        };
        queue.push(entry.clone());
        self.waiting_index
            .insert(connection_id, session_id.to_owned());
        log::info!("Connection {} waiting for {}", connection_id, session_id);
        (entry, true)
    }

    fn remove_waiting(&mut self, connection_id: &ConnectionId) -> Option<WaitingEntry> {
        let session_id = self.waiting_index.remove(connection_id)?;
        let queue = self.waiting.get_mut(&session_id)?;
        let position = queue.iter().position(|e| e.connection_id == *connection_id)?;
        let entry = queue.remove(position);
        if queue.is_empty() {
            self.waiting.remove(&session_id);
        }
        Some(entry)
    }

    fn is_waiting_in(&self, connection_id: &ConnectionId, session_id: &str) -> bool {
        self.waiting_index
            .get(connection_id)
            .map_or(false, |s| s == session_id)
    }

    /// Rooms that only ever held waiting entries go away with the last entry.
    fn collect_room(&mut self, session_id: &str) {
        if !self.waiting.contains_key(session_id) {
            self.registry.remove_room_if_empty(session_id);
        }
    }

    fn participant(&self, connection_id: &ConnectionId) -> Option<Participant> {
        self.registry.lookup(connection_id).map(|c| c.participant())
    }

    fn waiting_room_list(&self, host_id: ConnectionId, session_id: &str) -> Notification {
        Notification::unicast(
            host_id,
            ServerEvent::WaitingRoomList(self.waiting_list(session_id)),
        )
    }
}
