//! Error types shared across the crate.
//!
//! The split follows the trust boundary. A [`LocalError`] can only be caused
//! by a bug or API misuse on this node and is surfaced to the caller. A
//! [`Rejection`] is attributable to a peer (malformed packet, bad signature,
//! protocol violation) and never propagates past the state-machine driver,
//! which logs it and carries on.

use alloc::string::String;

use displaydoc::Display;

/// Local error: {0}
#[derive(Debug, Clone, Display)]
pub struct LocalError(String);

impl LocalError {
    /// Creates a new error from anything castable to string.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Rejected packet: {0}
///
/// A packet-level protocol violation attributable to a remote peer.
/// Rejections are caught by the state-machine driver, logged, and treated as
/// "no state change": the offending packet is simply not honored.
#[derive(Debug, Clone, Display)]
#[ignore_extra_doc_attributes]
pub struct Rejection(String);

impl Rejection {
    /// Creates a new rejection from anything castable to string.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The error type for state handlers, allowing a fatal [`LocalError`] to
/// bubble up through the driver while a [`Rejection`] is absorbed there.
#[derive(Debug, Clone, Display)]
pub enum StateError {
    /// {0}
    Local(LocalError),
    /// {0}
    Rejection(Rejection),
}

impl From<LocalError> for StateError {
    fn from(error: LocalError) -> Self {
        Self::Local(error)
    }
}

impl From<Rejection> for StateError {
    fn from(error: Rejection) -> Self {
        Self::Rejection(error)
    }
}
