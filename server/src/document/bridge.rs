//! Shared document rooms and their persistence.
//!
//! Each room is a task that owns its `yrs::Doc`. Everything that touches a
//! room goes through its command channel, so log appends and compaction for
//! one room never interleave, while separate rooms run independently.
//!
//! Commands are only ever sent while holding the room map lock, and a room
//! only removes itself from the map after draining its channel under that same
//! lock. A command can therefore never land in a room that is shutting down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::store::DocumentStore;
use crate::error::{DocumentError, StoreError};

pub type PeerId = Uuid;
pub type PeerTx = mpsc::UnboundedSender<Vec<u8>>;

type RoomTx = mpsc::UnboundedSender<RoomCommand>;
type RoomRx = mpsc::UnboundedReceiver<RoomCommand>;

enum RoomCommand {
    Attach {
        peer_id: PeerId,
        tx: PeerTx,
    },
    Detach {
        peer_id: PeerId,
    },
    Update {
        from: Option<PeerId>,
        update: Vec<u8>,
        reply: Option<oneshot::Sender<Result<(), DocumentError>>>,
    },
    EncodeState {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

struct BridgeInner {
    store: Option<Arc<dyn DocumentStore>>,
    compaction_threshold: usize,
    rooms: Mutex<HashMap<String, RoomTx>>,
    degraded_warned: AtomicBool,
}

impl BridgeInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomTx>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn warn_degraded(&self, session_id: &str, error: &StoreError) {
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Document store unreachable ({}); session {} and any later failures run in memory only",
                error,
                session_id
            );
        } else {
            log::debug!("Document store unreachable for session {}: {}", session_id, error);
        }
    }
}

#[derive(Clone)]
pub struct DocumentBridge {
    inner: Arc<BridgeInner>,
}

impl DocumentBridge {
    /// `store` is `None` when no durable store is configured or reachable.
    pub fn new(store: Option<Arc<dyn DocumentStore>>, compaction_threshold: usize) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                compaction_threshold: compaction_threshold.max(1),
                rooms: Mutex::new(HashMap::new()),
                degraded_warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn open_rooms(&self) -> usize {
        self.inner.rooms().len()
    }

    /// The peer first receives the full current state, then every update from other peers.
    pub fn attach(&self, session_id: &str, peer_id: PeerId, tx: PeerTx) {
        self.send(session_id, RoomCommand::Attach { peer_id, tx });
    }

    pub fn detach(&self, session_id: &str, peer_id: PeerId) {
        self.send(session_id, RoomCommand::Detach { peer_id });
    }

    pub fn update(&self, session_id: &str, from: PeerId, update: Vec<u8>) {
        self.send(
            session_id,
            RoomCommand::Update {
                from: Some(from),
                update,
                reply: None,
            },
        );
    }

    /// Applies an update and waits until it has been applied and, if possible, logged.
    pub async fn apply(&self, session_id: &str, update: Vec<u8>) -> Result<(), DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            session_id,
            RoomCommand::Update {
                from: None,
                update,
                reply: Some(reply),
            },
        );
        rx.await.map_err(|_| DocumentError::RoomClosed)?
    }

    pub async fn encode_state(&self, session_id: &str) -> Result<Vec<u8>, DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.send(session_id, RoomCommand::EncodeState { reply });
        rx.await.map_err(|_| DocumentError::RoomClosed)
    }

    /// Writes a snapshot and clears the log, whatever the log length.
    pub async fn flush(&self, session_id: &str) {
        let (reply, rx) = oneshot::channel();
        self.send(session_id, RoomCommand::Flush { reply });
        let _ = rx.await;
    }

    pub async fn flush_all(&self) {
        let session_ids: Vec<String> = self.inner.rooms().keys().cloned().collect();
        for session_id in session_ids {
            self.flush(&session_id).await;
        }
    }

    fn send(&self, session_id: &str, command: RoomCommand) {
        let mut rooms = self.inner.rooms();
        let tx = rooms.entry(session_id.to_owned()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_room(self.inner.clone(), session_id.to_owned(), rx));
            tx
        });
        if tx.send(command).is_err() {
            log::error!("Document room {} stopped unexpectedly", session_id);
            rooms.remove(session_id);
        }
    }
}

async fn run_room(inner: Arc<BridgeInner>, session_id: String, mut rx: RoomRx) {
    let mut room = DocumentRoom::hydrate(&inner, session_id).await;
    let mut pending: Option<RoomCommand> = None;

    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match rx.recv().await {
                Some(command) => command,
                None => break,
            },
        };

        let last_peer_left = room.handle(&inner, command).await;
        if !last_peer_left {
            continue;
        }

        room.flush(&inner).await;
        let mut rooms = inner.rooms();
        match rx.try_recv() {
            Ok(command) => pending = Some(command),
            Err(_) => {
                rooms.remove(&room.session_id);
                log::info!("Document room {} closed", room.session_id);
                break;
            }
        }
    }
}

struct DocumentRoom {
    session_id: String,
    doc: Doc,
    peers: HashMap<PeerId, PeerTx>,
    log_len: usize,
    persistent: bool,
}

impl DocumentRoom {
    /// Snapshot first, then every logged update in order. Falls back to an
    /// empty in-memory document when the store cannot be read.
    async fn hydrate(inner: &BridgeInner, session_id: String) -> Self {
        let mut room = Self {
            session_id,
            doc: Doc::new(),
            peers: HashMap::new(),
            log_len: 0,
            persistent: false,
        };

        let store = match &inner.store {
            Some(store) => store,
            None => return room,
        };

        let loaded = async {
            let snapshot = store.load_snapshot(&room.session_id).await?;
            let updates = store.load_updates(&room.session_id).await?;
            Ok::<_, StoreError>((snapshot, updates))
        }
        .await;

        match loaded {
            Ok((snapshot, updates)) => {
                if let Some(snapshot) = snapshot {
                    if let Err(e) = apply_update(&room.doc, &snapshot) {
                        log::error!("Snapshot of {} is unreadable: {}", room.session_id, e);
                    }
                }
                for update in &updates {
                    if let Err(e) = apply_update(&room.doc, update) {
                        log::warn!("Skipping logged update of {}: {}", room.session_id, e);
                    }
                }
                room.log_len = updates.len();
                room.persistent = true;
                log::info!(
                    "Document room {} hydrated with {} logged updates",
                    room.session_id,
                    room.log_len
                );
            }
            Err(e) => inner.warn_degraded(&room.session_id, &e),
        }
        room
    }

    /// Returns true when a detach left the room without peers.
    async fn handle(&mut self, inner: &BridgeInner, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Attach { peer_id, tx } => {
                if tx.send(self.encode_state()).is_ok() {
                    self.peers.insert(peer_id, tx);
                    log::debug!("Peer {} attached to document {}", peer_id, self.session_id);
                }
                false
            }
            RoomCommand::Detach { peer_id } => {
                let removed = self.peers.remove(&peer_id).is_some();
                log::debug!("Peer {} detached from document {}", peer_id, self.session_id);
                removed && self.peers.is_empty()
            }
            RoomCommand::Update {
                from,
                update,
                reply,
            } => {
                let result = self.apply(inner, from, update).await;
                if let Err(e) = &result {
                    log::warn!("Dropping update for {}: {}", self.session_id, e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                false
            }
            RoomCommand::EncodeState { reply } => {
                let _ = reply.send(self.encode_state());
                false
            }
            RoomCommand::Flush { reply } => {
                self.flush(inner).await;
                let _ = reply.send(());
                false
            }
        }
    }

    async fn apply(
        &mut self,
        inner: &BridgeInner,
        from: Option<PeerId>,
        update: Vec<u8>,
    ) -> Result<(), DocumentError> {
        apply_update(&self.doc, &update)?;

        self.peers.retain(|peer_id, tx| {
            Some(*peer_id) == from || tx.send(update.clone()).is_ok()
        });

        let store = match (&inner.store, self.persistent) {
            (Some(store), true) => store,
            _ => return Ok(()),
        };
        match store.append_update(&self.session_id, &update).await {
            Ok(()) => {
                self.log_len += 1;
                if self.log_len > inner.compaction_threshold {
                    self.compact(store.as_ref()).await;
                }
            }
            Err(e) => log::warn!("Could not log update for {}: {}", self.session_id, e),
        }
        Ok(())
    }

    async fn flush(&mut self, inner: &BridgeInner) {
        if let (Some(store), true) = (&inner.store, self.persistent) {
            self.compact(store.as_ref()).await;
        }
    }

    /// The log is cleared only once the snapshot write has succeeded.
    async fn compact(&mut self, store: &dyn DocumentStore) -> bool {
        let state = self.encode_state();
        if let Err(e) = store.write_snapshot(&self.session_id, &state).await {
            log::warn!("Snapshot of {} failed, keeping log: {}", self.session_id, e);
            return false;
        }
        if let Err(e) = store.clear_updates(&self.session_id).await {
            log::warn!("Could not clear log of {}: {}", self.session_id, e);
            return false;
        }
        log::debug!(
            "Compacted {} updates of {} into a snapshot",
            self.log_len,
            self.session_id
        );
        self.log_len = 0;
        true
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

fn apply_update(doc: &Doc, bytes: &[u8]) -> Result<(), DocumentError> {
    let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| DocumentError::Apply(e.to_string()))
}
