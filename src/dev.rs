/*!
Utilities for testing sessions.

[`TestSessionParams`] provides an implementation of the
[`SessionParameters`](crate::session::SessionParameters) trait with toy
cryptography, which in turn is used to set up
[`ServerSession`](crate::session::ServerSession)s and
[`ClientSession`](crate::session::ClientSession)s.

[`Network`] wires a whole overlay of sessions together in memory, pumping
messages deterministically and advancing a virtual clock, so multi-epoch
scenarios (including timers, crashes, and reconnects) run in microseconds
and without real time.
*/

mod network;
mod overlay;
mod session_parameters;

pub use network::{BufferSink, Network, TestNode};
pub use overlay::{Delivery, Hub, TestOverlay, VirtualClock};
pub use session_parameters::{TestSessionParams, TestSignature, TestSigner, TestVerifier};
