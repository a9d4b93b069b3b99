use alloc::boxed::Box;

use rand_core::CryptoRngCore;
use sha3::{digest::Digest, Sha3_256};
use signature::{DigestVerifier, Error, Keypair, RandomizedDigestSigner, SignatureEncoding};

use crate::errors::Rejection;
use crate::session::{ExchangePair, SessionParameters};

/// A toy signer: the "signature" binds the signer id to the message digest,
/// with no unforgeability whatsoever. Only usable in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TestSigner(u64);

impl TestSigner {
    /// Creates a signer with the given key id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The verifying counterpart of [`TestSigner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TestVerifier(u64);

/// The signature type corresponding to [`TestSigner`] and [`TestVerifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSignature {
    signed_by: u64,
    digest: [u8; 32],
}

impl RandomizedDigestSigner<Sha3_256, TestSignature> for TestSigner {
    fn try_sign_digest_with_rng(
        &self,
        _rng: &mut impl CryptoRngCore,
        digest: Sha3_256,
    ) -> Result<TestSignature, Error> {
        Ok(TestSignature {
            signed_by: self.0,
            digest: digest.finalize().into(),
        })
    }
}

impl Keypair for TestSigner {
    type VerifyingKey = TestVerifier;

    fn verifying_key(&self) -> Self::VerifyingKey {
        TestVerifier(self.0)
    }
}

impl DigestVerifier<Sha3_256, TestSignature> for TestVerifier {
    fn verify_digest(&self, digest: Sha3_256, signature: &TestSignature) -> Result<(), Error> {
        let digest: [u8; 32] = digest.finalize().into();
        if signature.signed_by == self.0 && signature.digest == digest {
            Ok(())
        } else {
            Err(Error::new())
        }
    }
}

impl From<TestSignature> for [u8; 40] {
    fn from(signature: TestSignature) -> Self {
        let mut bytes = [0u8; 40];
        bytes[..8].copy_from_slice(&signature.signed_by.to_be_bytes());
        bytes[8..].copy_from_slice(&signature.digest);
        bytes
    }
}

impl TryFrom<&[u8]> for TestSignature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 40 {
            return Err(Error::new());
        }
        let mut signed_by = [0u8; 8];
        signed_by.copy_from_slice(&bytes[..8]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[8..]);
        Ok(Self {
            signed_by: u64::from_be_bytes(signed_by),
            digest,
        })
    }
}

impl SignatureEncoding for TestSignature {
    type Repr = [u8; 40];
}

/// An implementation of [`SessionParameters`] using the toy scheme, for
/// testing.
#[derive(Debug, Clone, Copy)]
pub struct TestSessionParams;

impl SessionParameters for TestSessionParams {
    type Signer = TestSigner;
    type Digest = Sha3_256;
    type Verifier = TestVerifier;
    type Signature = TestSignature;

    fn generate_keypair(rng: &mut dyn CryptoRngCore) -> Self::Signer {
        TestSigner(rng.next_u64())
    }

    fn encode_key(key: &Self::Verifier) -> Box<[u8]> {
        Box::from(key.0.to_be_bytes())
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Verifier, Rejection> {
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Rejection::new("malformed test verifying key"))?;
        Ok(TestVerifier(u64::from_be_bytes(bytes)))
    }

    fn exchange_keypair(rng: &mut dyn CryptoRngCore) -> ExchangePair {
        let mut public = [0u8; 32];
        rng.fill_bytes(&mut public);
        let mut private = [0u8; 32];
        rng.fill_bytes(&mut private);
        ExchangePair {
            public: Box::from(public),
            private: Box::from(private),
        }
    }
}
