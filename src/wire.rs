//! The wire layer: bit-exact binary encoding, signed envelopes,
//! and the typed protocol messages.

mod envelope;
mod format;
mod messages;

pub use envelope::{sign_bytes, verify_bytes, Envelope};
pub use format::{from_bytes, to_bytes, WireError};
pub use messages::{
    Bytes, ClientQueue, ClientRegister, MessageType, ServerAgree, ServerEnlist, ServerInit, ServerList, ServerQueued,
    ServerStart, ServerStop, ServerVerifyList, SessionData, SessionMessage, GROUP_ID_SIZE, NONCE_SIZE,
};

pub(crate) use messages::{serialize_agree_list, serialize_register_list};

use crate::errors::Rejection;

impl From<WireError> for Rejection {
    fn from(error: WireError) -> Self {
        Rejection::new(alloc::format!("malformed packet: {error}"))
    }
}
