/*!
The session subsystem: epoch negotiation and round lifecycle.

Each participant owns one session object ([`ServerSession`] or
[`ClientSession`]) holding its state-machine driver and shared state. The
embedder pushes overlay events into the session ([`SessionHandle`]), drains
[`SessionEvent`]s back out, and supplies application payloads with
[`SessionHandle::send`]; payloads are delivered anonymously by the round of
some later epoch and surface at every participant's [`Sink`](`crate::round::Sink`).
*/

mod client;
mod params;
mod send_queue;
mod server;
mod shared;

pub use client::{ClientSession, ClientStateKey};
pub use params::{ExchangePair, SessionParameters};
pub use send_queue::SendQueue;
pub use server::{ServerSession, ServerStateKey, REGISTRATION_WINDOW_MS};

use alloc::{rc::Rc, string::String, vec::Vec};
use core::cell::RefCell;

use crate::errors::LocalError;
use crate::identity::{PeerId, RoundId};
use crate::round::Sink;
use crate::wire::MessageType;

/// Notifications a session emits towards its embedder.
///
/// Emitted for successful and unsuccessful rounds alike; consumers inspect
/// `successful`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A round is about to begin.
    RoundStarting {
        /// The epoch of the starting round.
        round_id: RoundId,
    },
    /// A round has ended.
    RoundFinished {
        /// The epoch of the finished round.
        round_id: RoundId,
        /// Whether the round delivered its payloads.
        successful: bool,
        /// A human-readable description of how the round ended.
        reason: String,
    },
    /// The session has been stopped and is now inert.
    Stopping {
        /// The reason passed to [`SessionHandle::stop`].
        reason: String,
    },
}

/// The façade binding overlay events to a session's state machine.
///
/// All methods are driven from one logical thread; handlers run to
/// completion and never block.
pub trait SessionHandle {
    /// Starts participating.
    fn start(&mut self) -> Result<(), LocalError>;

    /// Feeds an inbound overlay notification into the state machine.
    fn incoming(&mut self, from: PeerId, message_type: MessageType, packet: &[u8]) -> Result<(), LocalError>;

    /// Reports a connection coming up.
    fn handle_connection(&mut self, peer: PeerId) -> Result<(), LocalError>;

    /// Reports a connection going down.
    fn handle_disconnection(&mut self, peer: PeerId) -> Result<(), LocalError>;

    /// Gives the session a chance to act on an expired timer.
    fn tick(&mut self) -> Result<(), LocalError>;

    /// Queues application data for anonymous transmission.
    ///
    /// Data survives epoch restarts until a round delivers it.
    fn send(&mut self, data: &[u8]);

    /// Stops the session; it emits [`SessionEvent::Stopping`] and ignores
    /// all further input.
    fn stop(&mut self, reason: &str);

    /// Attaches the sink receiving round deliveries.
    fn set_sink(&mut self, sink: Rc<RefCell<dyn Sink>>);

    /// Drains the pending event queue.
    fn drain_events(&mut self) -> Vec<SessionEvent>;

    /// The next time [`tick`](`Self::tick`) needs to be called, if any.
    fn next_deadline(&self) -> Option<i64>;

    /// The current state, for diagnostics.
    fn state_name(&self) -> String;
}
