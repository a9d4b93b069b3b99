//! The anonymous-broadcast round interface and the trivial round.
//!
//! A round is a pluggable collaborator: the session negotiates the epoch and
//! the rosters, then hands control of data exchange to the round until it
//! reports itself finished. Any anonymity protocol can plug in here; the
//! [`NullRound`] is the minimal implementation (a plain relayed broadcast,
//! no anonymity) used to exercise the session machinery.

mod null;

pub use null::NullRound;

use alloc::{boxed::Box, rc::Rc, string::String};
use core::cell::RefCell;
use core::fmt::Debug;

use crate::errors::{LocalError, Rejection};
use crate::identity::{PeerId, Roster, RoundId};
use crate::overlay::Overlay;
use crate::session::{SendQueue, SessionParameters};

/// The data chunk size a round is asked to drain from the send queue.
pub const DATA_CHUNK_SIZE: usize = 1024;

/// A consumer of the cleartext a round delivers.
pub trait Sink {
    /// Accepts one delivered message.
    fn push(&mut self, data: &[u8]);
}

/// Whether a round is still running, and how it ended if not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundStatus {
    /// The round is in progress.
    Running,
    /// The round has ended.
    Finished {
        /// `true` if the round delivered what it set out to deliver.
        successful: bool,
        /// A human-readable description of how the round ended.
        reason: String,
    },
}

impl RoundStatus {
    /// Returns `true` while the round is in progress.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// This participant's secrets for one epoch.
#[derive_where::derive_where(Debug)]
pub struct PrivateIdentity<SP: SessionParameters> {
    /// The participant identifier.
    pub id: PeerId,
    /// The ephemeral signing key generated for this epoch.
    pub signer: SP::Signer,
    /// The private half of the exchange material.
    pub exchange_private: Box<[u8]>,
}

/// Everything a round needs to come into existence.
#[derive_where::derive_where(Debug)]
pub struct RoundEnv<SP: SessionParameters> {
    /// The admitted clients, in roster order.
    pub clients: Roster<SP>,
    /// The epoch's servers, in roster order.
    pub servers: Roster<SP>,
    /// This participant's per-epoch secrets.
    pub ident: PrivateIdentity<SP>,
    /// The negotiated epoch identifier.
    pub round_id: RoundId,
}

/// A factory producing the round for a freshly negotiated epoch.
pub type CreateRound<SP> = fn(RoundEnv<SP>) -> Result<Box<dyn Round>, LocalError>;

/// The collaborators a round borrows for the duration of one call.
///
/// Rounds hold no references back into the session; everything they need is
/// lent to them per call.
pub struct RoundContext<'a> {
    overlay: &'a dyn Overlay,
    send_queue: &'a mut SendQueue,
    sink: Option<Rc<RefCell<dyn Sink>>>,
}

impl<'a> RoundContext<'a> {
    pub(crate) fn new(
        overlay: &'a dyn Overlay,
        send_queue: &'a mut SendQueue,
        sink: Option<Rc<RefCell<dyn Sink>>>,
    ) -> Self {
        Self {
            overlay,
            send_queue,
            sink,
        }
    }

    /// The overlay transport.
    pub fn overlay(&self) -> &dyn Overlay {
        self.overlay
    }

    /// Drains up to `max` bytes of pending application data.
    pub fn get_data(&mut self, max: usize) -> (Box<[u8]>, bool) {
        self.send_queue.get(max)
    }

    /// Delivers cleartext to the session's sink, if one is attached.
    pub fn push_data(&mut self, data: &[u8]) {
        if let Some(sink) = &self.sink {
            sink.borrow_mut().push(data);
        }
    }
}

impl Debug for RoundContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RoundContext").finish_non_exhaustive()
    }
}

/// One run of an anonymity protocol over final rosters.
///
/// The session calls [`start`](`Self::start`) exactly once per epoch,
/// forwards every in-round data packet, and watches
/// [`status`](`Self::status`) flip to finished. An unsuccessful finish makes
/// the session rewind its send queue so undelivered payloads ride the next
/// epoch.
pub trait Round: Debug {
    /// The epoch this round belongs to.
    fn round_id(&self) -> &RoundId;

    /// Begins transmission; all rosters are final by this point.
    fn start(&mut self, ctx: &mut RoundContext<'_>) -> Result<(), LocalError>;

    /// Handles an in-round data packet from `from`.
    fn process_packet(&mut self, ctx: &mut RoundContext<'_>, from: &PeerId, data: &[u8]) -> Result<(), Rejection>;

    /// Reacts to a participant dropping off the overlay.
    fn handle_disconnect(&mut self, ctx: &mut RoundContext<'_>, peer: &PeerId);

    /// Terminates the round from outside.
    fn stop(&mut self, reason: &str);

    /// The current status; `successful` is meaningful only once finished.
    fn status(&self) -> &RoundStatus;
}
