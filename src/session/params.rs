use alloc::boxed::Box;
use core::fmt::Debug;

use digest::Digest;
use rand_core::CryptoRngCore;
use signature::{DigestVerifier, Keypair, RandomizedDigestSigner, SignatureEncoding};

use crate::errors::Rejection;

/// A freshly generated key-exchange pair, carried as opaque bytes.
///
/// The public half is bound into `Enlist`/`Register` messages and the
/// derived round id; the private half is handed to the round.
#[derive(Debug, Clone)]
pub struct ExchangePair {
    /// The public component, as it appears on the wire.
    pub public: Box<[u8]>,
    /// The private component.
    pub private: Box<[u8]>,
}

/// The cryptographic types and operations a session is instantiated with.
///
/// These will generally be determined by the embedding network: which
/// signature scheme authenticates participants, and which hash derives
/// round ids and signing digests. The session never names an algorithm.
pub trait SessionParameters: 'static {
    /// The signer type, used both for the long-term identity key and for the
    /// per-epoch ephemeral keys.
    type Signer: Debug + RandomizedDigestSigner<Self::Digest, Self::Signature> + Keypair<VerifyingKey = Self::Verifier>;

    /// The hash used to pre-hash message payloads before signing, and to
    /// derive round ids and roster digests.
    type Digest: Digest;

    /// The verifying key type.
    type Verifier: Debug + Clone + Ord + DigestVerifier<Self::Digest, Self::Signature>;

    /// The signature type corresponding to [`Signer`](`Self::Signer`) and
    /// [`Verifier`](`Self::Verifier`).
    type Signature: SignatureEncoding;

    /// Generates a fresh per-epoch signing key.
    fn generate_keypair(rng: &mut dyn CryptoRngCore) -> Self::Signer;

    /// Encodes a verifying key into its wire form.
    fn encode_key(key: &Self::Verifier) -> Box<[u8]>;

    /// Decodes a verifying key from its wire form.
    ///
    /// Failing here is what makes an ephemeral key "invalid" to the
    /// validation steps of the protocol.
    fn decode_key(bytes: &[u8]) -> Result<Self::Verifier, Rejection>;

    /// Generates fresh per-epoch key-exchange material.
    fn exchange_keypair(rng: &mut dyn CryptoRngCore) -> ExchangePair;
}
