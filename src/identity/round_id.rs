use alloc::boxed::Box;
use core::fmt;

use digest::Digest;
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{Hex, SliceLike};

use crate::session::SessionParameters;

/// The deterministic identifier of one epoch.
///
/// Derived by every server from the full set of `Enlist` payloads in server
/// roster order; every message following the Enlist phase carries this value
/// and receivers reject mismatches.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundId(#[serde(with = "SliceLike::<Hex>")] Box<[u8]>);

impl RoundId {
    /// Wraps raw identifier bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The placeholder identifier used before an epoch has been negotiated.
    pub fn empty() -> Self {
        Self(Box::from([]))
    }

    /// Returns `true` for the placeholder identifier.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derives the identifier from the given `Enlist` payloads,
    /// which must be supplied in server roster order.
    pub fn derive<SP: SessionParameters>(enlist_payloads: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut digest = SP::Digest::new_with_prefix(b"RoundId");
        for payload in enlist_payloads {
            digest.update(payload.as_ref());
        }
        Self(digest.finalize().as_slice().into())
    }
}

impl AsRef<[u8]> for RoundId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            None => write!(f, "RoundId(empty)"),
            Some(first) => write!(f, "RoundId({first:02x}..)"),
        }
    }
}
