mod bridge;
mod channel;
mod store;

pub use bridge::{DocumentBridge, PeerId, PeerTx};
pub use channel::{doc_index, session_of_room};
pub use store::{DocumentStore, SqliteDocumentStore};
