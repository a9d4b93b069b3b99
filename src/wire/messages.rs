//! Typed protocol messages.
//!
//! Each signed message retains the exact payload bytes it was built from or
//! parsed out of, so signature checks and the round-id derivation operate on
//! wire bytes and not on a re-serialization.

use alloc::{boxed::Box, format, string::String, vec::Vec};
use core::fmt;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{ArrayLike, Hex, SliceLike};

use crate::errors::LocalError;
use crate::identity::{PeerId, RoundId};
use crate::session::SessionParameters;

use super::envelope::{sign_bytes, verify_bytes, Envelope};
use super::format::{from_bytes, to_bytes, WireError};

/// The size of the nonces carried in `Init` and `Queue` messages.
pub const NONCE_SIZE: usize = 16;

/// The size of the group identifier carried in `Init`.
pub const GROUP_ID_SIZE: usize = 16;

/// A length-prefixed opaque byte string element.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bytes(#[serde(with = "SliceLike::<Hex>")] pub Box<[u8]>);

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({})", self.0.len())
    }
}

/// The overlay method a packet arrives on; doubles as the classification tag
/// of the parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageType {
    /// The proposer's epoch announcement.
    Init,
    /// Server-to-server enlistment into an announced epoch.
    Enlist,
    /// Server-to-server agreement on the derived round id.
    Agree,
    /// A client asking to be admitted.
    Queue,
    /// A server acknowledging a queued client.
    Queued,
    /// A client registering for the epoch.
    Register,
    /// A server shipping its admitted registrations to its peers.
    List,
    /// A server cross-signing the merged register list.
    VerifyList,
    /// A server releasing the final roster to its clients.
    Start,
    /// An authoritative epoch/session termination.
    Stop,
    /// In-round data, forwarded to the running round.
    Data,
}

impl MessageType {
    /// The overlay method name for this message type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Enlist => "Enlist",
            Self::Agree => "Agree",
            Self::Queue => "Queue",
            Self::Queued => "Queued",
            Self::Register => "Register",
            Self::List => "List",
            Self::VerifyList => "VerifyList",
            Self::Start => "Start",
            Self::Stop => "Stop",
            Self::Data => "SessionData",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize)]
struct InitPayload {
    sender: PeerId,
    #[serde(with = "ArrayLike::<Hex>")]
    nonce: [u8; NONCE_SIZE],
    timestamp: i64,
    #[serde(with = "ArrayLike::<Hex>")]
    group_id: [u8; GROUP_ID_SIZE],
}

/// The proposer's announcement that a new epoch should begin.
///
/// The timestamp orders competing announcements: a server never honors an
/// `Init` whose timestamp is not strictly greater than the last one it
/// honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    sender: PeerId,
    nonce: [u8; NONCE_SIZE],
    timestamp: i64,
    group_id: [u8; GROUP_ID_SIZE],
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerInit {
    /// Builds and signs a new announcement.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        sender: PeerId,
        timestamp: i64,
    ) -> Result<Self, LocalError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let group_id = [0u8; GROUP_ID_SIZE];
        let payload = to_bytes(&InitPayload {
            sender,
            nonce,
            timestamp,
            group_id,
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Init: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            sender,
            nonce,
            timestamp,
            group_id,
            payload,
            signature,
        })
    }

    /// Parses an announcement from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: InitPayload = from_bytes(&envelope.payload)?;
        Ok(Self {
            sender: parsed.sender,
            nonce: parsed.nonce,
            timestamp: parsed.timestamp,
            group_id: parsed.group_id,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the announcement back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the issuer's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The issuer (must be the proposer).
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// The announcement timestamp in milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The uniqueness nonce.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// The exact payload bytes the signature covers.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[derive(Serialize, Deserialize)]
struct EnlistPayload {
    sender: PeerId,
    #[serde(with = "SliceLike::<Hex>")]
    init: Box<[u8]>,
    #[serde(with = "SliceLike::<Hex>")]
    round_key: Box<[u8]>,
    #[serde(with = "SliceLike::<Hex>")]
    exchange: Box<[u8]>,
}

/// A server's enlistment into an announced epoch: its per-epoch ephemeral
/// key and exchange material, with a copy of the `Init` it is based on so a
/// receiver that missed the announcement can catch up from the enlistment
/// alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEnlist {
    sender: PeerId,
    init: ServerInit,
    round_key: Box<[u8]>,
    exchange: Box<[u8]>,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerEnlist {
    /// Builds and signs a new enlistment.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        sender: PeerId,
        init: &ServerInit,
        round_key: Box<[u8]>,
        exchange: Box<[u8]>,
    ) -> Result<Self, LocalError> {
        let payload = to_bytes(&EnlistPayload {
            sender,
            init: init.to_packet()?,
            round_key: round_key.clone(),
            exchange: exchange.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Enlist: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            sender,
            init: init.clone(),
            round_key,
            exchange,
            payload,
            signature,
        })
    }

    /// Parses an enlistment from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: EnlistPayload = from_bytes(&envelope.payload)?;
        let init = ServerInit::from_packet(&parsed.init)?;
        Ok(Self {
            sender: parsed.sender,
            init,
            round_key: parsed.round_key,
            exchange: parsed.exchange,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the enlistment back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the issuer's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The enlisting server.
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// The embedded epoch announcement.
    pub fn init(&self) -> &ServerInit {
        &self.init
    }

    /// The ephemeral public key for this epoch.
    pub fn round_key(&self) -> &[u8] {
        &self.round_key
    }

    /// The opaque exchange material for this epoch.
    pub fn exchange(&self) -> &[u8] {
        &self.exchange
    }

    /// The exact payload bytes the signature covers.
    ///
    /// The round id is derived over these, in server roster order.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[derive(Serialize, Deserialize)]
struct AgreePayload {
    sender: PeerId,
    round_id: RoundId,
    #[serde(with = "SliceLike::<Hex>")]
    round_key: Box<[u8]>,
    #[serde(with = "SliceLike::<Hex>")]
    exchange: Box<[u8]>,
}

/// A server's commitment to the derived round id, re-stating the ephemeral
/// key and exchange material it enlisted with so peers can cross-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAgree {
    sender: PeerId,
    round_id: RoundId,
    round_key: Box<[u8]>,
    exchange: Box<[u8]>,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerAgree {
    /// Builds and signs a new agreement.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        sender: PeerId,
        round_id: RoundId,
        round_key: Box<[u8]>,
        exchange: Box<[u8]>,
    ) -> Result<Self, LocalError> {
        let payload = to_bytes(&AgreePayload {
            sender,
            round_id: round_id.clone(),
            round_key: round_key.clone(),
            exchange: exchange.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Agree: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            sender,
            round_id,
            round_key,
            exchange,
            payload,
            signature,
        })
    }

    /// Parses an agreement from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: AgreePayload = from_bytes(&envelope.payload)?;
        Ok(Self {
            sender: parsed.sender,
            round_id: parsed.round_id,
            round_key: parsed.round_key,
            exchange: parsed.exchange,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the agreement back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the issuer's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The agreeing server.
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// The round id this server derived.
    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    /// The ephemeral public key for this epoch.
    pub fn round_key(&self) -> &[u8] {
        &self.round_key
    }

    /// The opaque exchange material for this epoch.
    pub fn exchange(&self) -> &[u8] {
        &self.exchange
    }
}

#[derive(Serialize, Deserialize)]
struct QueuePayload {
    #[serde(with = "SliceLike::<Hex>")]
    nonce: Box<[u8]>,
}

/// A client's request to be admitted into the next epoch.
///
/// Carries only a nonce; the client is authenticated later, by the signature
/// on its `Register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientQueue {
    nonce: Box<[u8]>,
}

impl ClientQueue {
    /// Builds a new admission request.
    pub fn new(nonce: Box<[u8]>) -> Self {
        Self { nonce }
    }

    /// Parses an admission request from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let parsed: QueuePayload = from_bytes(packet)?;
        Ok(Self { nonce: parsed.nonce })
    }

    /// Serializes the request into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        to_bytes(&QueuePayload {
            nonce: self.nonce.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Queue: {error}")))
    }

    /// The client's nonce, echoed back in `Queued`.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }
}

#[derive(Serialize, Deserialize)]
struct QueuedPayload {
    #[serde(with = "SliceLike::<Hex>")]
    agree_bytes: Box<[u8]>,
    #[serde(with = "SliceLike::<Hex>")]
    nonce: Box<[u8]>,
}

/// A server's answer to a queued client: the full signed `Agree` set for the
/// current epoch plus the client's nonce, signed by the answering server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQueued {
    agrees: Vec<ServerAgree>,
    agree_bytes: Box<[u8]>,
    nonce: Box<[u8]>,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerQueued {
    /// Builds and signs a new answer; `agree_bytes` is the precomputed
    /// serialization of `agrees`.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        agrees: Vec<ServerAgree>,
        agree_bytes: Box<[u8]>,
        nonce: Box<[u8]>,
    ) -> Result<Self, LocalError> {
        let payload = to_bytes(&QueuedPayload {
            agree_bytes: agree_bytes.clone(),
            nonce: nonce.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Queued: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            agrees,
            agree_bytes,
            nonce,
            payload,
            signature,
        })
    }

    /// Parses an answer from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: QueuedPayload = from_bytes(&envelope.payload)?;
        let agrees = parse_agree_list(&parsed.agree_bytes)?;
        Ok(Self {
            agrees,
            agree_bytes: parsed.agree_bytes,
            nonce: parsed.nonce,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the answer back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the answering server's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The `Agree` messages of all servers.
    pub fn agrees(&self) -> &[ServerAgree] {
        &self.agrees
    }

    /// The echoed client nonce.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }
}

#[derive(Serialize, Deserialize)]
struct RegisterPayload {
    sender: PeerId,
    round_id: RoundId,
    #[serde(with = "SliceLike::<Hex>")]
    round_key: Box<[u8]>,
    #[serde(with = "SliceLike::<Hex>")]
    exchange: Box<[u8]>,
}

/// A client's signed registration for the epoch it learned from `Queued`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegister {
    sender: PeerId,
    round_id: RoundId,
    round_key: Box<[u8]>,
    exchange: Box<[u8]>,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ClientRegister {
    /// Builds and signs a new registration.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        sender: PeerId,
        round_id: RoundId,
        round_key: Box<[u8]>,
        exchange: Box<[u8]>,
    ) -> Result<Self, LocalError> {
        let payload = to_bytes(&RegisterPayload {
            sender,
            round_id: round_id.clone(),
            round_key: round_key.clone(),
            exchange: exchange.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Register: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            sender,
            round_id,
            round_key,
            exchange,
            payload,
            signature,
        })
    }

    /// Parses a registration from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: RegisterPayload = from_bytes(&envelope.payload)?;
        Ok(Self {
            sender: parsed.sender,
            round_id: parsed.round_id,
            round_key: parsed.round_key,
            exchange: parsed.exchange,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the registration back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the registering client's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The registering client.
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// The epoch the client is registering for.
    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    /// The ephemeral public key for this epoch.
    pub fn round_key(&self) -> &[u8] {
        &self.round_key
    }

    /// The opaque exchange material for this epoch.
    pub fn exchange(&self) -> &[u8] {
        &self.exchange
    }
}

#[derive(Serialize, Deserialize)]
struct ListPayload {
    #[serde(with = "SliceLike::<Hex>")]
    register_bytes: Box<[u8]>,
}

/// The registrations a server locally admitted, shipped to its peers for
/// merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    registers: Vec<ClientRegister>,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerList {
    /// Builds and signs a new list.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        registers: Vec<ClientRegister>,
    ) -> Result<Self, LocalError> {
        let register_bytes = serialize_register_list(&registers)?;
        let payload = to_bytes(&ListPayload { register_bytes })
            .map_err(|error| LocalError::new(format!("failed to serialize List: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            registers,
            payload,
            signature,
        })
    }

    /// Parses a list from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: ListPayload = from_bytes(&envelope.payload)?;
        let registers = parse_register_list(&parsed.register_bytes)?;
        Ok(Self {
            registers,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the list back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the shipping server's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The shipped registrations.
    pub fn registers(&self) -> &[ClientRegister] {
        &self.registers
    }
}

#[derive(Serialize, Deserialize)]
struct VerifyListPayload {
    #[serde(with = "SliceLike::<Hex>")]
    signature: Box<[u8]>,
}

/// A server's signature over the hash of the merged register list.
///
/// Transported bare; its trust is the signature itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVerifyList {
    signature: Box<[u8]>,
}

impl ServerVerifyList {
    /// Wraps a signature over the merged-list hash.
    pub fn new(signature: Box<[u8]>) -> Self {
        Self { signature }
    }

    /// Parses from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let parsed: VerifyListPayload = from_bytes(packet)?;
        Ok(Self {
            signature: parsed.signature,
        })
    }

    /// Serializes into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        to_bytes(&VerifyListPayload {
            signature: self.signature.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize VerifyList: {error}")))
    }

    /// The carried signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

#[derive(Serialize, Deserialize)]
struct StartPayload {
    #[serde(with = "SliceLike::<Hex>")]
    register_bytes: Box<[u8]>,
    signatures: Vec<Bytes>,
}

/// The final merged roster released to clients, with one signature per
/// server (in server roster order) over the hash of the register bytes.
///
/// Transported bare; its trust derives from the embedded signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStart {
    registers: Vec<ClientRegister>,
    register_bytes: Box<[u8]>,
    signatures: Vec<Box<[u8]>>,
}

impl ServerStart {
    /// Builds a new roster release; `register_bytes` is the precomputed
    /// serialization of `registers`.
    pub fn new(registers: Vec<ClientRegister>, register_bytes: Box<[u8]>, signatures: Vec<Box<[u8]>>) -> Self {
        Self {
            registers,
            register_bytes,
            signatures,
        }
    }

    /// Parses a roster release from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let parsed: StartPayload = from_bytes(packet)?;
        let registers = parse_register_list(&parsed.register_bytes)?;
        Ok(Self {
            registers,
            register_bytes: parsed.register_bytes,
            signatures: parsed.signatures.into_iter().map(|bytes| bytes.0).collect(),
        })
    }

    /// Serializes the roster release into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        to_bytes(&StartPayload {
            register_bytes: self.register_bytes.clone(),
            signatures: self.signatures.iter().cloned().map(Bytes).collect(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Start: {error}")))
    }

    /// The merged registrations.
    pub fn registers(&self) -> &[ClientRegister] {
        &self.registers
    }

    /// The exact bytes the per-server signatures cover (after hashing).
    pub fn register_bytes(&self) -> &[u8] {
        &self.register_bytes
    }

    /// The per-server signatures, in server roster order.
    pub fn signatures(&self) -> &[Box<[u8]>] {
        &self.signatures
    }
}

#[derive(Serialize, Deserialize)]
struct StopPayload {
    round_id: RoundId,
    immediate: bool,
    reason: String,
}

/// An authoritative, signed termination of the current epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStop {
    round_id: RoundId,
    immediate: bool,
    reason: String,
    payload: Box<[u8]>,
    signature: Box<[u8]>,
}

impl ServerStop {
    /// Builds and signs a new termination.
    pub fn new<SP: SessionParameters>(
        rng: &mut dyn CryptoRngCore,
        signer: &SP::Signer,
        round_id: RoundId,
        immediate: bool,
        reason: impl Into<String>,
    ) -> Result<Self, LocalError> {
        let reason = reason.into();
        let payload = to_bytes(&StopPayload {
            round_id: round_id.clone(),
            immediate,
            reason: reason.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize Stop: {error}")))?;
        let signature = sign_bytes::<SP>(rng, signer, &payload)?;
        Ok(Self {
            round_id,
            immediate,
            reason,
            payload,
            signature,
        })
    }

    /// Parses a termination from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let envelope = Envelope::open(packet)?;
        let parsed: StopPayload = from_bytes(&envelope.payload)?;
        Ok(Self {
            round_id: parsed.round_id,
            immediate: parsed.immediate,
            reason: parsed.reason,
            payload: envelope.payload,
            signature: envelope.signature,
        })
    }

    /// Serializes the termination back into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        Envelope {
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .seal()
    }

    /// Checks the signature against the issuing server's long-term key.
    pub fn verify<SP: SessionParameters>(&self, key: &SP::Verifier) -> bool {
        verify_bytes::<SP>(key, &self.payload, &self.signature)
    }

    /// The epoch this termination refers to (may be empty pre-agreement).
    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    /// Whether the current round must be aborted without draining.
    pub fn immediate(&self) -> bool {
        self.immediate
    }

    /// The human-readable termination reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Serialize, Deserialize)]
struct DataPayload {
    round_id: RoundId,
    #[serde(with = "SliceLike::<Hex>")]
    data: Box<[u8]>,
}

/// In-round data, authenticated (if at all) by the round protocol itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    round_id: RoundId,
    data: Box<[u8]>,
}

impl SessionData {
    /// Builds a new data packet.
    pub fn new(round_id: RoundId, data: Box<[u8]>) -> Self {
        Self { round_id, data }
    }

    /// Parses a data packet from packet bytes.
    pub fn from_packet(packet: &[u8]) -> Result<Self, WireError> {
        let parsed: DataPayload = from_bytes(packet)?;
        Ok(Self {
            round_id: parsed.round_id,
            data: parsed.data,
        })
    }

    /// Serializes the data packet into packet bytes.
    pub fn to_packet(&self) -> Result<Box<[u8]>, LocalError> {
        to_bytes(&DataPayload {
            round_id: self.round_id.clone(),
            data: self.data.clone(),
        })
        .map_err(|error| LocalError::new(format!("failed to serialize SessionData: {error}")))
    }

    /// The epoch this data belongs to.
    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    /// The opaque round data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A parsed protocol message; classification is an exhaustive match on the
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// See [`ServerInit`].
    Init(ServerInit),
    /// See [`ServerEnlist`].
    Enlist(ServerEnlist),
    /// See [`ServerAgree`].
    Agree(ServerAgree),
    /// See [`ClientQueue`].
    Queue(ClientQueue),
    /// See [`ServerQueued`].
    Queued(ServerQueued),
    /// See [`ClientRegister`].
    Register(ClientRegister),
    /// See [`ServerList`].
    List(ServerList),
    /// See [`ServerVerifyList`].
    VerifyList(ServerVerifyList),
    /// See [`ServerStart`].
    Start(ServerStart),
    /// See [`ServerStop`].
    Stop(ServerStop),
    /// See [`SessionData`].
    Data(SessionData),
}

impl SessionMessage {
    /// Parses the packet bytes arriving on the given overlay method.
    pub fn parse(message_type: MessageType, packet: &[u8]) -> Result<Self, WireError> {
        Ok(match message_type {
            MessageType::Init => Self::Init(ServerInit::from_packet(packet)?),
            MessageType::Enlist => Self::Enlist(ServerEnlist::from_packet(packet)?),
            MessageType::Agree => Self::Agree(ServerAgree::from_packet(packet)?),
            MessageType::Queue => Self::Queue(ClientQueue::from_packet(packet)?),
            MessageType::Queued => Self::Queued(ServerQueued::from_packet(packet)?),
            MessageType::Register => Self::Register(ClientRegister::from_packet(packet)?),
            MessageType::List => Self::List(ServerList::from_packet(packet)?),
            MessageType::VerifyList => Self::VerifyList(ServerVerifyList::from_packet(packet)?),
            MessageType::Start => Self::Start(ServerStart::from_packet(packet)?),
            MessageType::Stop => Self::Stop(ServerStop::from_packet(packet)?),
            MessageType::Data => Self::Data(SessionData::from_packet(packet)?),
        })
    }

    /// The classification tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Init(_) => MessageType::Init,
            Self::Enlist(_) => MessageType::Enlist,
            Self::Agree(_) => MessageType::Agree,
            Self::Queue(_) => MessageType::Queue,
            Self::Queued(_) => MessageType::Queued,
            Self::Register(_) => MessageType::Register,
            Self::List(_) => MessageType::List,
            Self::VerifyList(_) => MessageType::VerifyList,
            Self::Start(_) => MessageType::Start,
            Self::Stop(_) => MessageType::Stop,
            Self::Data(_) => MessageType::Data,
        }
    }
}

/// Serializes a list of agreements as their full packets.
pub(crate) fn serialize_agree_list(agrees: &[ServerAgree]) -> Result<Box<[u8]>, LocalError> {
    let packets = agrees
        .iter()
        .map(|agree| agree.to_packet().map(Bytes))
        .collect::<Result<Vec<_>, _>>()?;
    to_bytes(&packets).map_err(|error| LocalError::new(format!("failed to serialize an Agree list: {error}")))
}

/// Parses a list of agreements from their full packets.
pub(crate) fn parse_agree_list(bytes: &[u8]) -> Result<Vec<ServerAgree>, WireError> {
    let packets: Vec<Bytes> = from_bytes(bytes)?;
    packets
        .iter()
        .map(|packet| ServerAgree::from_packet(&packet.0))
        .collect()
}

/// Serializes a list of registrations as their full packets.
pub(crate) fn serialize_register_list(registers: &[ClientRegister]) -> Result<Box<[u8]>, LocalError> {
    let packets = registers
        .iter()
        .map(|register| register.to_packet().map(Bytes))
        .collect::<Result<Vec<_>, _>>()?;
    to_bytes(&packets).map_err(|error| LocalError::new(format!("failed to serialize a Register list: {error}")))
}

/// Parses a list of registrations from their full packets.
pub(crate) fn parse_register_list(bytes: &[u8]) -> Result<Vec<ClientRegister>, WireError> {
    let packets: Vec<Bytes> = from_bytes(bytes)?;
    packets
        .iter()
        .map(|packet| ClientRegister::from_packet(&packet.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    use rand_core::SeedableRng;
    use signature::Keypair;

    use super::{
        parse_agree_list, serialize_agree_list, ClientQueue, ClientRegister, MessageType, ServerAgree, ServerEnlist,
        ServerInit, ServerStop, SessionData, SessionMessage,
    };
    use crate::dev::{TestSessionParams, TestSigner};
    use crate::identity::{PeerId, RoundId};

    type SP = TestSessionParams;

    fn rng() -> rand_chacha::ChaCha8Rng {
        rand_chacha::ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn init_roundtrip_and_signature() {
        let mut rng = rng();
        let signer = TestSigner::new(11);
        let sender = PeerId::random(&mut rng);
        let init = ServerInit::new::<SP>(&mut rng, &signer, sender, 12345).unwrap();

        let parsed = ServerInit::from_packet(&init.to_packet().unwrap()).unwrap();
        assert_eq!(parsed, init);
        assert_eq!(parsed.timestamp(), 12345);
        assert!(parsed.verify::<SP>(&signer.verifying_key()));
        assert!(!parsed.verify::<SP>(&TestSigner::new(12).verifying_key()));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut rng = rng();
        let signer = TestSigner::new(11);
        let sender = PeerId::random(&mut rng);
        let init = ServerInit::new::<SP>(&mut rng, &signer, sender, 1).unwrap();

        let mut packet = init.to_packet().unwrap().into_vec();
        // Flip a byte inside the enveloped payload.
        packet[10] ^= 0xff;
        let parsed = ServerInit::from_packet(&packet).unwrap();
        assert!(!parsed.verify::<SP>(&signer.verifying_key()));
    }

    #[test]
    fn enlist_embeds_the_announcement() {
        let mut rng = rng();
        let signer = TestSigner::new(3);
        let sender = PeerId::random(&mut rng);
        let init = ServerInit::new::<SP>(&mut rng, &signer, sender, 99).unwrap();
        let enlist = ServerEnlist::new::<SP>(
            &mut rng,
            &signer,
            sender,
            &init,
            Box::from(*b"roundkey"),
            Box::from(*b"exchange"),
        )
        .unwrap();

        let parsed = ServerEnlist::from_packet(&enlist.to_packet().unwrap()).unwrap();
        assert_eq!(parsed, enlist);
        assert_eq!(parsed.init(), &init);
        assert!(parsed.verify::<SP>(&signer.verifying_key()));
    }

    #[test]
    fn agree_list_roundtrip() {
        let mut rng = rng();
        let round_id = RoundId::new(*b"roundid");
        let agrees = (0..3u64)
            .map(|index| {
                let signer = TestSigner::new(index);
                let peer_id = PeerId::random(&mut rng);
                ServerAgree::new::<SP>(
                    &mut rng,
                    &signer,
                    peer_id,
                    round_id.clone(),
                    Box::from(index.to_be_bytes()),
                    Box::from(*b"exchange"),
                )
                .unwrap()
            })
            .collect::<Vec<_>>();

        let bytes = serialize_agree_list(&agrees).unwrap();
        let parsed = parse_agree_list(&bytes).unwrap();
        assert_eq!(parsed, agrees);
    }

    #[test]
    fn stop_and_data_roundtrip() {
        let mut rng = rng();
        let signer = TestSigner::new(8);
        let stop = ServerStop::new::<SP>(&mut rng, &signer, RoundId::new(*b"rid"), true, "going away").unwrap();
        let parsed = ServerStop::from_packet(&stop.to_packet().unwrap()).unwrap();
        assert_eq!(parsed, stop);
        assert!(parsed.immediate());
        assert_eq!(parsed.reason(), "going away");
        assert!(parsed.verify::<SP>(&signer.verifying_key()));

        let data = SessionData::new(RoundId::new(*b"rid"), Box::from(*b"payload"));
        let parsed = SessionData::from_packet(&data.to_packet().unwrap()).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn parse_dispatches_on_the_method_tag() {
        let mut rng = rng();
        let signer = TestSigner::new(21);
        let sender = PeerId::random(&mut rng);

        let queue = ClientQueue::new(Box::from(*b"nonce"));
        let message = SessionMessage::parse(MessageType::Queue, &queue.to_packet().unwrap()).unwrap();
        assert_eq!(message.message_type(), MessageType::Queue);

        let register = ClientRegister::new::<SP>(
            &mut rng,
            &signer,
            sender,
            RoundId::new(*b"rid"),
            Box::from(*b"key"),
            Box::from(*b"exch"),
        )
        .unwrap();
        let message = SessionMessage::parse(MessageType::Register, &register.to_packet().unwrap()).unwrap();
        assert_eq!(message.message_type(), MessageType::Register);

        // A Register packet is not parseable as an Init.
        assert!(SessionMessage::parse(MessageType::Init, &queue.to_packet().unwrap()).is_err());
    }
}
