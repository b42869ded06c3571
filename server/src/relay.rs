use serde_json::Value;

use system::{ConnectionId, ServerEvent};

use crate::bus::BroadcastBus;

/// Forwards a peer-negotiation payload untouched.
///
/// An unknown destination means the peer is already gone; the payload is
/// dropped and the sender is not told.
pub fn relay(bus: &mut BroadcastBus, from: ConnectionId, to: ConnectionId, payload: Value) -> bool {
    if !bus.contains(&to) {
        log::debug!("Dropping signal from {} to departed {}", from, to);
        return false;
    }
    bus.unicast(
        &to,
        ServerEvent::Signal {
            from_connection_id: from,
            payload,
        },
    )
}
