use core::fmt;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{ArrayLike, Hex};

/// The size of a participant identifier in bytes.
pub const ID_SIZE: usize = 16;

/// An opaque fixed-size participant identifier.
///
/// The derived [`Ord`] is lexicographic over the raw bytes; proposer election
/// picks the smallest identifier in the server roster.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "ArrayLike::<Hex>")] [u8; ID_SIZE]);

impl PeerId {
    /// Wraps raw identifier bytes.
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generates a random identifier.
    pub fn random(rng: &mut impl CryptoRngCore) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first four bytes are enough to tell test participants apart.
        write!(
            f,
            "PeerId({:02x}{:02x}{:02x}{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}
