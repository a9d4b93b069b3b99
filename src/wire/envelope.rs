//! The `(payload || signature)` wrapping shared by all authenticated
//! messages, and the signature binding over exact payload bytes.

use alloc::{boxed::Box, format};

use digest::Digest;
use rand_core::{CryptoRng, CryptoRngCore, Error as RngError, RngCore};
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{Hex, SliceLike};
use signature::{DigestVerifier, RandomizedDigestSigner, SignatureEncoding};

use crate::errors::LocalError;
use crate::session::SessionParameters;

use super::format::{from_bytes, to_bytes, WireError};

/// The domain prefix mixed into every message signature.
const MESSAGE_DOMAIN: &[u8] = b"SessionMessage";

/// A signed packet: a serialized payload followed by a signature over the
/// exact payload bytes, produced with the issuer's long-term key.
///
/// Receivers must verify the signature against the payload bytes as they
/// appeared on the wire, before trusting any parsed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The serialized payload.
    #[serde(with = "SliceLike::<Hex>")]
    pub payload: Box<[u8]>,
    /// The signature over `payload`.
    #[serde(with = "SliceLike::<Hex>")]
    pub signature: Box<[u8]>,
}

impl Envelope {
    /// Serializes the envelope into packet bytes.
    pub fn seal(&self) -> Result<Box<[u8]>, LocalError> {
        to_bytes(self).map_err(|error| LocalError::new(format!("failed to serialize an envelope: {error}")))
    }

    /// Parses an envelope from packet bytes.
    pub fn open(packet: &[u8]) -> Result<Self, WireError> {
        from_bytes(packet)
    }
}

/// Signs `payload` with the long-term key, returning the wire form of the
/// signature.
pub fn sign_bytes<SP: SessionParameters>(
    rng: &mut dyn CryptoRngCore,
    signer: &SP::Signer,
    payload: &[u8],
) -> Result<Box<[u8]>, LocalError> {
    let digest = SP::Digest::new_with_prefix(MESSAGE_DOMAIN).chain_update(payload);
    let signature = signer
        .try_sign_digest_with_rng(&mut RngCoreRef(rng), digest)
        .map_err(|error| LocalError::new(format!("signing failed: {error}")))?;
    Ok(signature.to_bytes().as_ref().into())
}

/// A sized forwarding wrapper around a `&mut dyn CryptoRngCore`.
///
/// The `signature` crate's randomized-signing APIs require a `Sized`
/// generic implementing [`CryptoRngCore`], which a bare trait object cannot
/// satisfy; this adapter forwards to the trait object so callers can keep
/// passing it around as `&mut dyn CryptoRngCore`.
struct RngCoreRef<'a>(&'a mut dyn CryptoRngCore);

impl RngCore for RngCoreRef<'_> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RngError> {
        self.0.try_fill_bytes(dest)
    }
}

impl CryptoRng for RngCoreRef<'_> {}

/// Verifies a signature over `payload` under the given long-term key.
///
/// Any failure (undecodable signature included) verifies as `false`.
pub fn verify_bytes<SP: SessionParameters>(key: &SP::Verifier, payload: &[u8], signature: &[u8]) -> bool {
    let signature = match SP::Signature::try_from(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let digest = SP::Digest::new_with_prefix(MESSAGE_DOMAIN).chain_update(payload);
    key.verify_digest(digest, &signature).is_ok()
}
