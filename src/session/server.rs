//! The server session: proposer election, epoch negotiation, client
//! admission, roster exchange, and round supervision.

use alloc::{boxed::Box, collections::BTreeMap, format, rc::Rc, string::String, vec::Vec};
use core::cell::RefCell;
use core::fmt;

use rand_core::CryptoRngCore;
use tracing::{debug, warn};

use crate::errors::{LocalError, Rejection, StateError};
use crate::identity::{KeyDirectory, PeerId, RoundId};
use crate::machine::{PacketKind, ProcessResult, State, StateMachine};
use crate::overlay::{Clock, Overlay};
use crate::round::{CreateRound, Sink};
use crate::wire::{
    serialize_agree_list, serialize_register_list, sign_bytes, verify_bytes, ClientQueue, ClientRegister, MessageType,
    ServerAgree, ServerEnlist, ServerInit, ServerList, ServerQueued, ServerStart, ServerStop, ServerVerifyList,
    SessionMessage,
};

use super::params::SessionParameters;
use super::shared::SessionCore;
use super::{SessionEvent, SessionHandle};

/// The length of the client-admission window, in milliseconds.
pub const REGISTRATION_WINDOW_MS: i64 = 30_000;

/// The states of the server state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerStateKey {
    /// Not yet started.
    Offline,
    /// Waiting for both full server connectivity and (for non-proposers) an
    /// epoch announcement.
    WaitingForServersAndInit,
    /// Connected to all servers, waiting for the proposer's announcement.
    WaitingForInit,
    /// Holding an announcement, waiting for full server connectivity.
    WaitingForServers,
    /// Exchanging `Enlist` messages.
    Enlisting,
    /// Exchanging `Agree` messages over the derived round id.
    Agreeing,
    /// Admitting clients until the registration window closes.
    Registering,
    /// Exchanging admitted-client lists.
    Rostering,
    /// Cross-signing the merged register list.
    Verifying,
    /// A round is in progress.
    Communicating,
}

pub(crate) struct ServerSharedState<SP: SessionParameters> {
    pub(crate) core: SessionCore<SP>,
    proposer: PeerId,
    init: Option<ServerInit>,
    // Survives epoch resets: the replay defense must outlive the epoch.
    last_init_timestamp: Option<i64>,
    enlists: BTreeMap<PeerId, ServerEnlist>,
    agrees: BTreeMap<PeerId, ServerAgree>,
    agree_bytes: Box<[u8]>,
    registered: BTreeMap<PeerId, ClientRegister>,
    lists: BTreeMap<PeerId, Vec<ClientRegister>>,
    register_bytes: Box<[u8]>,
    register_hash: Box<[u8]>,
    verifications: BTreeMap<PeerId, Box<[u8]>>,
    pub(crate) registration_deadline: Option<i64>,
}

impl<SP: SessionParameters> ServerSharedState<SP> {
    fn new(core: SessionCore<SP>, proposer: PeerId) -> Self {
        Self {
            core,
            proposer,
            init: None,
            last_init_timestamp: None,
            enlists: BTreeMap::new(),
            agrees: BTreeMap::new(),
            agree_bytes: Box::from([]),
            registered: BTreeMap::new(),
            lists: BTreeMap::new(),
            register_bytes: Box::from([]),
            register_hash: Box::from([]),
            verifications: BTreeMap::new(),
            registration_deadline: None,
        }
    }

    fn clear_epoch(&mut self) {
        self.core.clear_epoch();
        self.init = None;
        self.enlists.clear();
        self.agrees.clear();
        self.agree_bytes = Box::from([]);
        self.registered.clear();
        self.lists.clear();
        self.register_bytes = Box::from([]);
        self.register_hash = Box::from([]);
        self.verifications.clear();
        self.registration_deadline = None;
    }

    fn is_proposer(&self) -> bool {
        self.proposer == self.core.local_id()
    }

    fn server_count(&self) -> usize {
        self.core.overlay.server_ids().len()
    }

    fn server_ids(&self) -> Vec<PeerId> {
        self.core.overlay.server_ids().to_vec()
    }

    /// Validates an announcement and adopts it. Returns `false` when the
    /// announcement is the one already honored (not an error, no new state).
    fn honor_init(&mut self, init: &ServerInit, transport_sender: Option<&PeerId>) -> Result<bool, Rejection> {
        if let Some(sender) = transport_sender {
            if *sender != self.proposer {
                return Err(Rejection::new(format!("Init relayed by non-proposer {sender:?}")));
            }
        }
        if *init.sender() != self.proposer {
            return Err(Rejection::new(format!("Init issued by non-proposer {:?}", init.sender())));
        }
        if self.init.as_ref() == Some(init) {
            return Ok(false);
        }
        let key = self.core.directory.key_of(&self.proposer)?;
        if !init.verify::<SP>(key) {
            return Err(Rejection::new("invalid signature on Init"));
        }
        if let Some(last) = self.last_init_timestamp {
            if init.timestamp() <= last {
                return Err(Rejection::new(format!(
                    "stale Init: timestamp {} is not past {last}",
                    init.timestamp()
                )));
            }
        }
        self.init = Some(init.clone());
        self.last_init_timestamp = Some(init.timestamp());
        Ok(true)
    }

    /// Whether an announcement would supersede the honored one; used for
    /// classification, so it must fully authenticate the message.
    fn newer_init(&self, init: &ServerInit) -> bool {
        if *init.sender() != self.proposer {
            return false;
        }
        if let Some(last) = self.last_init_timestamp {
            if init.timestamp() <= last {
                return false;
            }
        }
        self.core
            .directory
            .key_of(&self.proposer)
            .map(|key| init.verify::<SP>(key))
            .unwrap_or(false)
    }

    /// Restart classification before an epoch is underway: only a Stop.
    fn restart_on_stop(&self, message: &SessionMessage) -> bool {
        matches!(message, SessionMessage::Stop(stop) if self.core.valid_stop(stop))
    }

    /// Restart classification once an epoch is underway: a Stop, or a
    /// strictly newer announcement (direct or embedded in an Enlist).
    fn restart_on_newer_epoch(&self, message: &SessionMessage) -> bool {
        match message {
            SessionMessage::Stop(stop) => self.core.valid_stop(stop),
            SessionMessage::Init(init) => self.newer_init(init),
            SessionMessage::Enlist(enlist) => self.newer_init(enlist.init()),
            _ => false,
        }
    }

    fn send_init(&mut self) -> Result<(), StateError> {
        // The clock may not have advanced since the last epoch; announcement
        // timestamps must still be strictly increasing.
        let timestamp = match self.last_init_timestamp {
            Some(last) => self.core.clock.now_ms().max(last + 1),
            None => self.core.clock.now_ms(),
        };
        let local = self.core.local_id();
        let init = ServerInit::new::<SP>(self.core.rng.as_mut(), &self.core.signer, local, timestamp)?;
        debug!(?local, timestamp, "announcing a new epoch");

        // The proposer honors its own announcement directly.
        self.init = Some(init.clone());
        self.last_init_timestamp = Some(timestamp);

        let packet = init.to_packet()?;
        for id in self.server_ids() {
            if id != local {
                self.core.overlay.send_to(&id, MessageType::Init, &packet);
            }
        }
        Ok(())
    }

    fn send_enlist(&mut self) -> Result<(), StateError> {
        let init = self
            .init
            .clone()
            .ok_or_else(|| LocalError::new("enlisting without an honored Init"))?;
        self.core.generate_round_data();
        let round_key = self.core.round_key_public()?;
        let exchange = self.core.exchange_public()?;
        let local = self.core.local_id();
        let enlist = ServerEnlist::new::<SP>(self.core.rng.as_mut(), &self.core.signer, local, &init, round_key, exchange)?;
        debug!(?local, "enlisting");
        let packet = enlist.to_packet()?;
        for id in self.server_ids() {
            self.core.overlay.send_to(&id, MessageType::Enlist, &packet);
        }
        Ok(())
    }

    fn record_enlist(&mut self, from: &PeerId, enlist: ServerEnlist) -> Result<(), Rejection> {
        if !self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("Enlist from non-server {from:?}")));
        }
        if self.enlists.contains_key(from) {
            return Err(Rejection::new(format!("already have an Enlist from {from:?}")));
        }
        if enlist.sender() != from {
            return Err(Rejection::new(format!(
                "Enlist sender {:?} does not match {from:?}",
                enlist.sender()
            )));
        }
        let key = self.core.directory.key_of(from)?;
        if !enlist.verify::<SP>(key) {
            return Err(Rejection::new(format!("invalid signature on Enlist from {from:?}")));
        }
        SP::decode_key(enlist.round_key())
            .map_err(|_| Rejection::new(format!("invalid ephemeral key in Enlist from {from:?}")))?;
        self.enlists.insert(*from, enlist);
        debug!(
            local = ?self.core.local_id(),
            have = self.enlists.len(),
            expected = self.server_count(),
            "recorded an Enlist"
        );
        Ok(())
    }

    fn enlists_complete(&self) -> bool {
        self.enlists.len() == self.server_count()
    }

    /// Derives the round id from all Enlist payloads (roster order) and
    /// broadcasts our `Agree`.
    fn finish_enlisting(&mut self) -> Result<(), StateError> {
        let round_id = RoundId::derive::<SP>(self.enlists.values().map(|enlist| enlist.payload()));
        debug!(local = ?self.core.local_id(), ?round_id, "enlistment finished, agreeing");
        self.core.round_id = Some(round_id.clone());

        let round_key = self.core.round_key_public()?;
        let exchange = self.core.exchange_public()?;
        let local = self.core.local_id();
        let agree = ServerAgree::new::<SP>(self.core.rng.as_mut(), &self.core.signer, local, round_id, round_key, exchange)?;
        let packet = agree.to_packet()?;
        for id in self.server_ids() {
            self.core.overlay.send_to(&id, MessageType::Agree, &packet);
        }
        Ok(())
    }

    fn record_agree(&mut self, from: &PeerId, agree: ServerAgree) -> Result<(), Rejection> {
        if !self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("Agree from non-server {from:?}")));
        }
        if self.agrees.contains_key(from) {
            return Err(Rejection::new(format!("already have an Agree from {from:?}")));
        }
        if agree.sender() != from {
            return Err(Rejection::new(format!(
                "Agree sender {:?} does not match {from:?}",
                agree.sender()
            )));
        }
        self.core.check_server_agree(&agree)?;
        let enlist = self
            .enlists
            .get(from)
            .ok_or_else(|| Rejection::new(format!("Agree from {from:?} without a matching Enlist")))?;
        if enlist.round_key() != agree.round_key() || enlist.exchange() != agree.exchange() {
            return Err(Rejection::new(format!("Agree from {from:?} contradicts its Enlist")));
        }
        self.agrees.insert(*from, agree);
        Ok(())
    }

    fn agrees_complete(&self) -> bool {
        self.agrees.len() == self.server_count()
    }

    fn finish_agreeing(&mut self) -> Result<(), StateError> {
        debug!(local = ?self.core.local_id(), "agreement finished, admitting clients");
        self.core.server_list = self.agrees.values().cloned().collect();
        self.agree_bytes = serialize_agree_list(&self.core.server_list)?;
        Ok(())
    }

    fn answer_queue(&mut self, from: &PeerId, queue: &ClientQueue) -> Result<(), StateError> {
        if self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("Queue from server {from:?}")).into());
        }
        let queued = ServerQueued::new::<SP>(
            self.core.rng.as_mut(),
            &self.core.signer,
            self.core.server_list.clone(),
            self.agree_bytes.clone(),
            queue.nonce().into(),
        )?;
        let packet = queued.to_packet()?;
        self.core.overlay.send_to(from, MessageType::Queued, &packet);
        Ok(())
    }

    fn check_client_register(&self, register: &ClientRegister) -> Result<(), Rejection> {
        match (&self.core.round_id, register.round_id()) {
            (Some(ours), theirs) if ours == theirs => {}
            _ => {
                return Err(Rejection::new(format!(
                    "round id mismatch in Register from {:?}",
                    register.sender()
                )))
            }
        }
        let key = self.core.directory.key_of(register.sender())?;
        if !register.verify::<SP>(key) {
            return Err(Rejection::new(format!(
                "invalid signature on Register from {:?}",
                register.sender()
            )));
        }
        SP::decode_key(register.round_key())
            .map_err(|_| Rejection::new(format!("invalid ephemeral key in Register from {:?}", register.sender())))?;
        Ok(())
    }

    fn record_register(&mut self, from: &PeerId, register: ClientRegister) -> Result<(), Rejection> {
        if self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("Register from server {from:?}")));
        }
        if self.registered.contains_key(from) {
            return Err(Rejection::new(format!("{from:?} already registered")));
        }
        if register.sender() != from {
            return Err(Rejection::new(format!(
                "Register sender {:?} does not match {from:?}",
                register.sender()
            )));
        }
        self.check_client_register(&register)?;
        debug!(local = ?self.core.local_id(), client = ?from, "client registered");
        self.registered.insert(*from, register);
        Ok(())
    }

    fn send_list(&mut self) -> Result<(), StateError> {
        let list = ServerList::new::<SP>(
            self.core.rng.as_mut(),
            &self.core.signer,
            self.registered.values().cloned().collect(),
        )?;
        debug!(
            local = ?self.core.local_id(),
            admitted = self.registered.len(),
            "admission window closed, exchanging lists"
        );
        let packet = list.to_packet()?;
        for id in self.server_ids() {
            self.core.overlay.send_to(&id, MessageType::List, &packet);
        }
        Ok(())
    }

    fn record_list(&mut self, from: &PeerId, list: ServerList) -> Result<(), Rejection> {
        if !self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("List from non-server {from:?}")));
        }
        if self.lists.contains_key(from) {
            return Err(Rejection::new(format!("already have a List from {from:?}")));
        }
        let key = self.core.directory.key_of(from)?;
        if !list.verify::<SP>(key) {
            return Err(Rejection::new(format!("invalid signature on List from {from:?}")));
        }
        for register in list.registers() {
            self.check_client_register(register)?;
        }
        self.lists.insert(*from, list.registers().to_vec());
        Ok(())
    }

    fn lists_complete(&self) -> bool {
        self.lists.len() == self.server_count()
    }

    /// Merges the collected lists deterministically, hashes the merged
    /// serialization, and broadcasts our signature over it.
    fn finish_rostering(&mut self) -> Result<(), StateError> {
        self.core.client_list = merge_registers(&self.lists);
        self.register_bytes = serialize_register_list(&self.core.client_list)?;
        self.register_hash = SessionCore::<SP>::hash_register_bytes(&self.register_bytes);
        debug!(
            local = ?self.core.local_id(),
            clients = self.core.client_list.len(),
            "merged the register lists, verifying"
        );

        let signature = sign_bytes::<SP>(self.core.rng.as_mut(), &self.core.signer, &self.register_hash)?;
        let packet = ServerVerifyList::new(signature).to_packet()?;
        for id in self.server_ids() {
            self.core.overlay.send_to(&id, MessageType::VerifyList, &packet);
        }
        Ok(())
    }

    fn record_verification(&mut self, from: &PeerId, verify: &ServerVerifyList) -> Result<(), Rejection> {
        if !self.core.overlay.is_server(from) {
            return Err(Rejection::new(format!("VerifyList from non-server {from:?}")));
        }
        if self.verifications.contains_key(from) {
            return Err(Rejection::new(format!("already have a VerifyList from {from:?}")));
        }
        let key = self.core.directory.key_of(from)?;
        if !verify_bytes::<SP>(key, &self.register_hash, verify.signature()) {
            return Err(Rejection::new(format!("invalid VerifyList signature from {from:?}")));
        }
        self.verifications.insert(*from, verify.signature().into());
        Ok(())
    }

    fn verifications_complete(&self) -> bool {
        self.verifications.len() == self.server_count()
    }

    /// Releases the verified roster to the locally admitted clients and
    /// builds the round.
    fn finish_verifying(&mut self) -> Result<(), StateError> {
        debug!(local = ?self.core.local_id(), "roster verified, starting the round");
        let signatures = self.verifications.values().cloned().collect();
        let start = ServerStart::new(self.core.client_list.clone(), self.register_bytes.clone(), signatures);
        let packet = start.to_packet()?;
        for client in self.registered.keys() {
            self.core.overlay.send_to(client, MessageType::Start, &packet);
        }
        self.core.build_round()?;
        Ok(())
    }

    fn broadcast_stop(&mut self, reason: &str, immediate: bool) -> Result<(), LocalError> {
        let round_id = self.core.round_id.clone().unwrap_or_else(RoundId::empty);
        let stop = ServerStop::new::<SP>(self.core.rng.as_mut(), &self.core.signer, round_id, immediate, reason)?;
        let packet = stop.to_packet()?;
        self.core.overlay.broadcast(MessageType::Stop, &packet);
        Ok(())
    }
}

/// Merges per-server register lists into one roster, ordered by client id.
///
/// For a client appearing in several lists, the entry shipped by the
/// smallest server id wins, so all honest servers merge to identical bytes
/// regardless of arrival order.
fn merge_registers(lists: &BTreeMap<PeerId, Vec<ClientRegister>>) -> Vec<ClientRegister> {
    let mut merged: BTreeMap<PeerId, ClientRegister> = BTreeMap::new();
    for registers in lists.values() {
        for register in registers {
            merged.entry(*register.sender()).or_insert_with(|| register.clone());
        }
    }
    merged.into_values().collect()
}

/// The shared reaction to a server dropping off mid-negotiation: tell
/// everyone, then restart the epoch.
fn server_disconnect<SP: SessionParameters>(
    shared: &mut ServerSharedState<SP>,
    peer: &PeerId,
) -> Result<ProcessResult<ServerStateKey>, StateError> {
    if !shared.core.overlay.is_server(peer) {
        return Ok(ProcessResult::NoChange);
    }
    warn!(local = ?shared.core.local_id(), server = ?peer, "server disconnected");
    shared.broadcast_stop(&format!("{peer:?} disconnected"), true)?;
    Ok(ProcessResult::Restart)
}

fn check_servers<SP: SessionParameters>(
    shared: &mut ServerSharedState<SP>,
) -> Result<ProcessResult<ServerStateKey>, StateError> {
    if !shared.core.overlay.all_servers_connected() {
        debug!(local = ?shared.core.local_id(), "waiting for full server connectivity");
        return Ok(ProcessResult::NoChange);
    }
    if shared.is_proposer() {
        shared.send_init()?;
        Ok(ProcessResult::ToState(ServerStateKey::WaitingForServers))
    } else {
        Ok(ProcessResult::ToState(ServerStateKey::WaitingForInit))
    }
}

struct Offline;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Offline {
    fn process_packet(
        &mut self,
        _shared: &mut ServerSharedState<SP>,
        _from: &PeerId,
        _message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        Ok(ProcessResult::Ignore)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(
            message.message_type(),
            MessageType::Init | MessageType::Enlist | MessageType::Queue
        )
    }
}

struct WaitingForServersAndInit;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for WaitingForServersAndInit {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.clear_epoch();
        check_servers(shared)
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::Init(init) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.honor_init(&init, Some(from))?;
        Ok(ProcessResult::ToState(ServerStateKey::WaitingForServers))
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Enlist | MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_connection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        if shared.core.overlay.is_server(peer) {
            check_servers(shared)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct WaitingForInit;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for WaitingForInit {
    fn check_packet(
        &self,
        shared: &ServerSharedState<SP>,
        expected: Option<MessageType>,
        message: &SessionMessage,
    ) -> PacketKind {
        // An Enlist carries the announcement it is based on; process it here
        // instead of stalling until the direct Init arrives.
        if matches!(message, SessionMessage::Enlist(_)) {
            return PacketKind::Process;
        }
        if expected == Some(message.message_type()) {
            PacketKind::Process
        } else if self.store_packet(shared, message) {
            PacketKind::Store
        } else if self.restart_packet(shared, message) {
            PacketKind::Restart
        } else {
            PacketKind::Ignore
        }
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        match message {
            SessionMessage::Init(init) => {
                shared.honor_init(&init, Some(from))?;
                Ok(ProcessResult::NextState)
            }
            SessionMessage::Enlist(enlist) => {
                shared.honor_init(enlist.init(), None)?;
                shared.record_enlist(from, enlist)?;
                Ok(ProcessResult::NextState)
            }
            _ => Ok(ProcessResult::Ignore),
        }
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct WaitingForServers;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for WaitingForServers {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        if shared.core.overlay.all_servers_connected() {
            Ok(ProcessResult::NextState)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        // A newer announcement may replace the held one while we wait.
        let SessionMessage::Init(init) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.honor_init(&init, Some(from))?;
        Ok(ProcessResult::NoChange)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Enlist | MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_connection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        if shared.core.overlay.is_server(peer) && shared.core.overlay.all_servers_connected() {
            Ok(ProcessResult::NextState)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Enlisting;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Enlisting {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.send_enlist()?;
        Ok(ProcessResult::NoChange)
    }

    fn check_packet(
        &self,
        shared: &ServerSharedState<SP>,
        expected: Option<MessageType>,
        message: &SessionMessage,
    ) -> PacketKind {
        // An Enlist based on a newer announcement supersedes this epoch; the
        // restart replays the message so the new negotiation keeps it.
        if let SessionMessage::Enlist(enlist) = message {
            if shared.newer_init(enlist.init()) {
                return PacketKind::Restart;
            }
            return PacketKind::Process;
        }
        if expected == Some(message.message_type()) {
            PacketKind::Process
        } else if self.store_packet(shared, message) {
            PacketKind::Store
        } else if self.restart_packet(shared, message) {
            PacketKind::Restart
        } else {
            PacketKind::Ignore
        }
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::Enlist(enlist) = message else {
            return Ok(ProcessResult::Ignore);
        };
        if shared.init.as_ref() != Some(enlist.init()) {
            return Err(Rejection::new(format!("Enlist from {from:?} references a stale Init")).into());
        }
        shared.record_enlist(from, enlist)?;
        if !shared.enlists_complete() {
            return Ok(ProcessResult::NoChange);
        }
        shared.finish_enlisting()?;
        Ok(ProcessResult::NextState)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Agree | MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Agreeing;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Agreeing {
    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::Agree(agree) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.record_agree(from, agree)?;
        if !shared.agrees_complete() {
            return Ok(ProcessResult::NoChange);
        }
        shared.finish_agreeing()?;
        Ok(ProcessResult::NextState)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::List | MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Registering;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Registering {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.registration_deadline = Some(shared.core.clock.now_ms() + REGISTRATION_WINDOW_MS);
        Ok(ProcessResult::NoChange)
    }

    fn check_packet(
        &self,
        shared: &ServerSharedState<SP>,
        _expected: Option<MessageType>,
        message: &SessionMessage,
    ) -> PacketKind {
        match message.message_type() {
            MessageType::Queue | MessageType::Register => PacketKind::Process,
            _ if self.store_packet(shared, message) => PacketKind::Store,
            _ if self.restart_packet(shared, message) => PacketKind::Restart,
            _ => PacketKind::Ignore,
        }
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        match message {
            SessionMessage::Queue(queue) => shared.answer_queue(from, &queue)?,
            SessionMessage::Register(register) => shared.record_register(from, register)?,
            _ => {}
        }
        Ok(ProcessResult::NoChange)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::List)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_timeout(
        &mut self,
        _shared: &mut ServerSharedState<SP>,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        Ok(ProcessResult::NextState)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Rostering;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Rostering {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.send_list()?;
        Ok(ProcessResult::NoChange)
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::List(list) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.record_list(from, list)?;
        if !shared.lists_complete() {
            return Ok(ProcessResult::NoChange);
        }
        shared.finish_rostering()?;
        Ok(ProcessResult::NextState)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::VerifyList | MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Verifying;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Verifying {
    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::VerifyList(verify) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.record_verification(from, &verify)?;
        if !shared.verifications_complete() {
            return Ok(ProcessResult::NoChange);
        }
        shared.finish_verifying()?;
        Ok(ProcessResult::NextState)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Queue | MessageType::Data)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        server_disconnect(shared, peer)
    }
}

struct Communicating;

impl<SP: SessionParameters> State<ServerStateKey, ServerSharedState<SP>> for Communicating {
    fn init(&mut self, shared: &mut ServerSharedState<SP>) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.core.start_round()?;
        Ok(ProcessResult::NoChange)
    }

    fn process_packet(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        let SessionMessage::Data(data) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.core.process_round_data(from, &data)?;
        Ok(ProcessResult::NoChange)
    }

    fn store_packet(&self, _shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Queue)
    }

    fn restart_packet(&self, shared: &ServerSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_newer_epoch(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ServerSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ServerStateKey>, StateError> {
        shared.core.round_disconnect(peer);
        if shared.core.overlay.is_server(peer) {
            warn!(local = ?shared.core.local_id(), server = ?peer, "server disconnected mid-round");
            shared.broadcast_stop(&format!("{peer:?} disconnected"), true)?;
        }
        // The round's own status drives what happens next; the session
        // notices it finished after this handler returns.
        Ok(ProcessResult::NoChange)
    }
}

/// A server participant's session.
pub struct ServerSession<SP: SessionParameters> {
    machine: StateMachine<ServerStateKey, ServerSharedState<SP>>,
    shared: ServerSharedState<SP>,
    stopped: bool,
}

impl<SP: SessionParameters> ServerSession<SP> {
    /// Creates a session; it stays inert until
    /// [`start`](`SessionHandle::start`).
    pub fn new(
        rng: Box<dyn CryptoRngCore>,
        overlay: Rc<dyn Overlay>,
        clock: Rc<dyn Clock>,
        signer: SP::Signer,
        directory: KeyDirectory<SP>,
        create_round: CreateRound<SP>,
    ) -> Result<Self, LocalError> {
        let proposer = overlay
            .proposer()
            .ok_or_else(|| LocalError::new("the server roster is empty"))?;
        let core = SessionCore::new(rng, overlay, clock, signer, directory, create_round);
        let mut shared = ServerSharedState::new(core, proposer);

        let mut machine = StateMachine::new();
        machine.add_state(ServerStateKey::Offline, None, || Box::new(Offline));
        machine.add_state(ServerStateKey::WaitingForServersAndInit, Some(MessageType::Init), || {
            Box::new(WaitingForServersAndInit)
        });
        machine.add_state(ServerStateKey::WaitingForInit, Some(MessageType::Init), || {
            Box::new(WaitingForInit)
        });
        machine.add_state(ServerStateKey::WaitingForServers, Some(MessageType::Init), || {
            Box::new(WaitingForServers)
        });
        machine.add_state(ServerStateKey::Enlisting, Some(MessageType::Enlist), || Box::new(Enlisting));
        machine.add_state(ServerStateKey::Agreeing, Some(MessageType::Agree), || Box::new(Agreeing));
        machine.add_state(ServerStateKey::Registering, Some(MessageType::Register), || {
            Box::new(Registering)
        });
        machine.add_state(ServerStateKey::Rostering, Some(MessageType::List), || Box::new(Rostering));
        machine.add_state(ServerStateKey::Verifying, Some(MessageType::VerifyList), || {
            Box::new(Verifying)
        });
        machine.add_state(ServerStateKey::Communicating, Some(MessageType::Data), || {
            Box::new(Communicating)
        });

        machine.add_transition(ServerStateKey::Offline, ServerStateKey::WaitingForServersAndInit);
        machine.add_transition(ServerStateKey::WaitingForServersAndInit, ServerStateKey::WaitingForInit);
        machine.add_transition(ServerStateKey::WaitingForServersAndInit, ServerStateKey::WaitingForServers);
        machine.add_transition(ServerStateKey::WaitingForInit, ServerStateKey::Enlisting);
        machine.add_transition(ServerStateKey::WaitingForServers, ServerStateKey::Enlisting);
        machine.add_transition(ServerStateKey::Enlisting, ServerStateKey::Agreeing);
        machine.add_transition(ServerStateKey::Agreeing, ServerStateKey::Registering);
        machine.add_transition(ServerStateKey::Registering, ServerStateKey::Rostering);
        machine.add_transition(ServerStateKey::Rostering, ServerStateKey::Verifying);
        machine.add_transition(ServerStateKey::Verifying, ServerStateKey::Communicating);
        machine.add_transition(ServerStateKey::Communicating, ServerStateKey::WaitingForServersAndInit);

        machine.set_initial_state(ServerStateKey::WaitingForServersAndInit);
        machine.set_state(&mut shared, ServerStateKey::Offline)?;

        Ok(Self {
            machine,
            shared,
            stopped: false,
        })
    }

    /// The current state, for diagnostics and tests.
    pub fn state(&self) -> Option<ServerStateKey> {
        self.machine.current_state()
    }

    fn after(&mut self) -> Result<(), LocalError> {
        if let Some((round_id, successful, reason)) = self.shared.core.take_finished_round() {
            if !successful {
                self.shared.core.send_queue.unget();
            }
            self.shared.core.events.push_back(SessionEvent::RoundFinished {
                round_id,
                successful,
                reason,
            });
            self.machine.state_complete(&mut self.shared)?;
        }
        Ok(())
    }
}

impl<SP: SessionParameters> SessionHandle for ServerSession<SP> {
    fn start(&mut self) -> Result<(), LocalError> {
        self.machine.state_complete(&mut self.shared)
    }

    fn incoming(&mut self, from: PeerId, message_type: MessageType, packet: &[u8]) -> Result<(), LocalError> {
        if self.stopped {
            return Ok(());
        }
        let message = match SessionMessage::parse(message_type, packet) {
            Ok(message) => message,
            Err(error) => {
                warn!(?from, %message_type, %error, "dropping an unparseable packet");
                return Ok(());
            }
        };
        self.machine.process_packet(&mut self.shared, from, message)?;
        self.after()
    }

    fn handle_connection(&mut self, peer: PeerId) -> Result<(), LocalError> {
        if self.stopped {
            return Ok(());
        }
        self.machine.handle_connection(&mut self.shared, &peer)?;
        self.after()
    }

    fn handle_disconnection(&mut self, peer: PeerId) -> Result<(), LocalError> {
        if self.stopped {
            return Ok(());
        }
        self.machine.handle_disconnection(&mut self.shared, &peer)?;
        self.after()
    }

    fn tick(&mut self) -> Result<(), LocalError> {
        if self.stopped {
            return Ok(());
        }
        let now = self.shared.core.clock.now_ms();
        if let Some(deadline) = self.shared.registration_deadline {
            if now >= deadline {
                self.shared.registration_deadline = None;
                self.machine.handle_timeout(&mut self.shared)?;
                self.after()?;
            }
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) {
        self.shared.core.send_queue.add(data.into());
    }

    fn stop(&mut self, reason: &str) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.core.teardown_round(reason);
        self.shared.core.events.push_back(SessionEvent::Stopping {
            reason: reason.into(),
        });
    }

    fn set_sink(&mut self, sink: Rc<RefCell<dyn Sink>>) {
        self.shared.core.sink = Some(sink);
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.shared.core.events.drain(..).collect()
    }

    fn next_deadline(&self) -> Option<i64> {
        if self.stopped {
            None
        } else {
            self.shared.registration_deadline
        }
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.machine.current_state())
    }
}

impl<SP: SessionParameters> fmt::Debug for ServerSession<SP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("state", &self.machine.current_state())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};

    use rand_core::SeedableRng;

    use super::merge_registers;
    use crate::dev::{TestSessionParams, TestSigner};
    use crate::identity::{PeerId, RoundId};
    use crate::wire::{serialize_register_list, ClientRegister};

    fn register(rng: &mut rand_chacha::ChaCha8Rng, key: u64, client: PeerId) -> ClientRegister {
        ClientRegister::new::<TestSessionParams>(
            rng,
            &TestSigner::new(key),
            client,
            RoundId::new(*b"epoch"),
            Box::from(key.to_be_bytes()),
            Box::from(*b"exchange"),
        )
        .unwrap()
    }

    #[test]
    fn merge_prefers_the_smallest_server_and_is_order_independent() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(17);
        let server_small = PeerId::new([1; 16]);
        let server_large = PeerId::new([2; 16]);

        let client_shared = PeerId::random(&mut rng);
        let client_a = PeerId::random(&mut rng);
        let client_b = PeerId::random(&mut rng);

        // The shared client produced two different registrations, one per
        // server; the one shipped by the smaller server id must win.
        let from_small = register(&mut rng, 100, client_shared);
        let from_large = register(&mut rng, 200, client_shared);
        let only_a = register(&mut rng, 300, client_a);
        let only_b = register(&mut rng, 400, client_b);

        let mut lists = BTreeMap::new();
        lists.insert(server_small, vec![only_a.clone(), from_small.clone()]);
        lists.insert(server_large, vec![from_large.clone(), only_b.clone()]);
        let merged = merge_registers(&lists);

        let mut reversed = BTreeMap::new();
        reversed.insert(server_large, vec![only_b.clone(), from_large]);
        reversed.insert(server_small, vec![from_small.clone(), only_a.clone()]);
        let merged_reversed = merge_registers(&reversed);

        // Deterministic result: identical contents, identical bytes.
        let bytes = serialize_register_list(&merged).unwrap();
        let bytes_reversed = serialize_register_list(&merged_reversed).unwrap();
        assert_eq!(bytes, bytes_reversed);

        // Ordered by client id, shared entry taken from the smaller server.
        let mut expected: Vec<ClientRegister> = vec![from_small, only_a, only_b];
        expected.sort_by_key(|register| *register.sender());
        assert_eq!(merged, expected);
    }
}
