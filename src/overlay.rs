//! The collaborator seams a session is constructed over.
//!
//! Both are supplied as borrowed handles at session construction; nothing in
//! this crate reaches for a process-wide transport or clock, which is what
//! makes sessions runnable under virtual time.

use alloc::vec::Vec;

use crate::identity::PeerId;
use crate::wire::MessageType;

/// The overlay transport: authenticated peer-to-peer channels keyed by
/// participant identifier.
///
/// Ordering within one peer-to-peer channel is assumed to be preserved;
/// there is no ordering guarantee across peers. The connection table is
/// expected to include the local participant itself.
pub trait Overlay {
    /// The local participant's identifier.
    fn local_id(&self) -> PeerId;

    /// The configured server roster, sorted ascending.
    ///
    /// The first entry is the proposer.
    fn server_ids(&self) -> &[PeerId];

    /// The identifiers this participant currently has a connection to.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Sends a unicast notification.
    fn send_to(&self, to: &PeerId, message_type: MessageType, packet: &[u8]);

    /// Broadcasts a notification to every reachable participant.
    fn broadcast(&self, message_type: MessageType, packet: &[u8]);

    /// Returns `true` if `id` is part of the server roster.
    fn is_server(&self, id: &PeerId) -> bool {
        self.server_ids().contains(id)
    }

    /// The proposer of new epochs: the smallest server identifier.
    fn proposer(&self) -> Option<PeerId> {
        self.server_ids().first().copied()
    }

    /// Returns `true` once a connection to every server is up.
    fn all_servers_connected(&self) -> bool {
        let connected = self.connected_peers();
        self.server_ids().iter().all(|id| connected.contains(id))
    }
}

/// The time source; milliseconds since an arbitrary epoch.
pub trait Clock {
    /// The current time in milliseconds.
    fn now_ms(&self) -> i64;
}
