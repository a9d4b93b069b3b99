use alloc::{
    boxed::Box,
    collections::VecDeque,
    format,
    rc::Rc,
    string::{String, ToString},
    vec::Vec,
};
use core::cell::RefCell;

use digest::Digest;
use rand_core::CryptoRngCore;
use signature::Keypair;

use crate::errors::{LocalError, Rejection};
use crate::identity::{KeyDirectory, PeerId, Roster, RosterEntry, RoundId};
use crate::overlay::{Clock, Overlay};
use crate::round::{CreateRound, PrivateIdentity, Round, RoundContext, RoundEnv, RoundStatus, Sink};
use crate::wire::{ClientRegister, ServerAgree, ServerStop, SessionData};

use super::params::{ExchangePair, SessionParameters};
use super::send_queue::SendQueue;
use super::SessionEvent;

/// The record shared between a session's states: collaborators, long-term
/// identity, and the epoch-scoped negotiation results.
///
/// Epoch-scoped fields are cleared on every return to the initial epoch
/// state; the send queue and event queue survive across epochs.
pub(crate) struct SessionCore<SP: SessionParameters> {
    pub(crate) overlay: Rc<dyn Overlay>,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) rng: Box<dyn CryptoRngCore>,
    pub(crate) signer: SP::Signer,
    pub(crate) directory: KeyDirectory<SP>,
    pub(crate) create_round: CreateRound<SP>,

    pub(crate) round_id: Option<RoundId>,
    round_signer: Option<SP::Signer>,
    exchange: Option<ExchangePair>,
    pub(crate) server_list: Vec<ServerAgree>,
    pub(crate) client_list: Vec<ClientRegister>,
    pub(crate) round: Option<Box<dyn Round>>,

    pub(crate) send_queue: SendQueue,
    pub(crate) sink: Option<Rc<RefCell<dyn Sink>>>,
    pub(crate) events: VecDeque<SessionEvent>,
}

impl<SP: SessionParameters> SessionCore<SP> {
    pub(crate) fn new(
        rng: Box<dyn CryptoRngCore>,
        overlay: Rc<dyn Overlay>,
        clock: Rc<dyn Clock>,
        signer: SP::Signer,
        directory: KeyDirectory<SP>,
        create_round: CreateRound<SP>,
    ) -> Self {
        Self {
            overlay,
            clock,
            rng,
            signer,
            directory,
            create_round,
            round_id: None,
            round_signer: None,
            exchange: None,
            server_list: Vec::new(),
            client_list: Vec::new(),
            round: None,
            send_queue: SendQueue::new(),
            sink: None,
            events: VecDeque::new(),
        }
    }

    pub(crate) fn local_id(&self) -> PeerId {
        self.overlay.local_id()
    }

    /// Drops all epoch-scoped fields, aborting a still-running round.
    pub(crate) fn clear_epoch(&mut self) {
        self.teardown_round("epoch restarting");
        self.round_id = None;
        self.round_signer = None;
        self.exchange = None;
        self.server_list.clear();
        self.client_list.clear();
    }

    /// Ends the current round, if any, rewinding the send queue and emitting
    /// `RoundFinished` when it did not succeed.
    pub(crate) fn teardown_round(&mut self, reason: &str) {
        if let Some(mut round) = self.round.take() {
            if round.status().is_running() {
                round.stop(reason);
            }
            if let RoundStatus::Finished { successful, reason } = round.status() {
                let successful = *successful;
                if !successful {
                    self.send_queue.unget();
                }
                self.events.push_back(SessionEvent::RoundFinished {
                    round_id: round.round_id().clone(),
                    successful,
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Takes the round out if it has finished, returning its outcome.
    pub(crate) fn take_finished_round(&mut self) -> Option<(RoundId, bool, String)> {
        let finished = self
            .round
            .as_ref()
            .is_some_and(|round| !round.status().is_running());
        if !finished {
            return None;
        }
        let round = self.round.take()?;
        match round.status() {
            RoundStatus::Finished { successful, reason } => {
                Some((round.round_id().clone(), *successful, reason.clone()))
            }
            RoundStatus::Running => None,
        }
    }

    /// Generates the per-epoch ephemeral signing key and exchange material.
    pub(crate) fn generate_round_data(&mut self) {
        self.round_signer = Some(SP::generate_keypair(self.rng.as_mut()));
        self.exchange = Some(SP::exchange_keypair(self.rng.as_mut()));
    }

    /// The wire form of the ephemeral public key.
    pub(crate) fn round_key_public(&self) -> Result<Box<[u8]>, LocalError> {
        let signer = self
            .round_signer
            .as_ref()
            .ok_or_else(|| LocalError::new("no round data generated"))?;
        Ok(SP::encode_key(&signer.verifying_key()))
    }

    /// The wire form of the exchange public component.
    pub(crate) fn exchange_public(&self) -> Result<Box<[u8]>, LocalError> {
        self.exchange
            .as_ref()
            .map(|pair| pair.public.clone())
            .ok_or_else(|| LocalError::new("no round data generated"))
    }

    /// Verifies that a `ServerAgree` is properly formed for the adopted
    /// epoch: matching round id, valid signature, decodable ephemeral key.
    pub(crate) fn check_server_agree(&self, agree: &ServerAgree) -> Result<(), Rejection> {
        let round_id = self
            .round_id
            .as_ref()
            .ok_or_else(|| Rejection::new("no epoch adopted yet"))?;
        if agree.round_id() != round_id {
            return Err(Rejection::new(format!(
                "round id mismatch in Agree from {:?}",
                agree.sender()
            )));
        }
        let key = self.directory.key_of(agree.sender())?;
        if !agree.verify::<SP>(key) {
            return Err(Rejection::new(format!("invalid signature on Agree from {:?}", agree.sender())));
        }
        SP::decode_key(agree.round_key())
            .map_err(|_| Rejection::new(format!("invalid ephemeral key in Agree from {:?}", agree.sender())))?;
        Ok(())
    }

    /// Checks whether a `Stop` is authoritative: signed by some server, for
    /// a compatible epoch.
    pub(crate) fn valid_stop(&self, stop: &ServerStop) -> bool {
        let epoch_compatible =
            stop.round_id().is_empty() || self.round_id.is_none() || self.round_id.as_ref() == Some(stop.round_id());
        if !epoch_compatible {
            return false;
        }
        self.overlay.server_ids().iter().any(|id| {
            self.directory
                .key_of(id)
                .map(|key| stop.verify::<SP>(key))
                .unwrap_or(false)
        })
    }

    /// Builds the round for the negotiated epoch from the accumulated
    /// `Agree` and `Register` lists.
    pub(crate) fn build_round(&mut self) -> Result<(), LocalError> {
        let round_id = self
            .round_id
            .clone()
            .ok_or_else(|| LocalError::new("no epoch negotiated"))?;
        let servers = self.agree_roster()?;
        let clients = self.register_roster()?;
        let signer = self
            .round_signer
            .take()
            .ok_or_else(|| LocalError::new("no round data generated"))?;
        let exchange = self
            .exchange
            .take()
            .ok_or_else(|| LocalError::new("no round data generated"))?;
        let ident = PrivateIdentity::<SP> {
            id: self.local_id(),
            signer,
            exchange_private: exchange.private,
        };
        let env = RoundEnv {
            clients,
            servers,
            ident,
            round_id,
        };
        self.round = Some((self.create_round)(env)?);
        Ok(())
    }

    fn agree_roster(&self) -> Result<Roster<SP>, LocalError> {
        let entries = self
            .server_list
            .iter()
            .map(|agree| {
                let public_key = self
                    .directory
                    .key_of(agree.sender())
                    .map_err(|error| LocalError::new(error.to_string()))?
                    .clone();
                let round_key = SP::decode_key(agree.round_key()).map_err(|error| LocalError::new(error.to_string()))?;
                Ok(RosterEntry {
                    id: *agree.sender(),
                    public_key,
                    round_key,
                    exchange: agree.exchange().into(),
                })
            })
            .collect::<Result<Vec<_>, LocalError>>()?;
        Roster::new(entries)
    }

    fn register_roster(&self) -> Result<Roster<SP>, LocalError> {
        let entries = self
            .client_list
            .iter()
            .map(|register| {
                let public_key = self
                    .directory
                    .key_of(register.sender())
                    .map_err(|error| LocalError::new(error.to_string()))?
                    .clone();
                let round_key =
                    SP::decode_key(register.round_key()).map_err(|error| LocalError::new(error.to_string()))?;
                Ok(RosterEntry {
                    id: *register.sender(),
                    public_key,
                    round_key,
                    exchange: register.exchange().into(),
                })
            })
            .collect::<Result<Vec<_>, LocalError>>()?;
        Roster::new(entries)
    }

    /// Runs a closure against the current round with a borrowed context.
    pub(crate) fn with_round<R>(&mut self, f: impl FnOnce(&mut dyn Round, &mut RoundContext<'_>) -> R) -> Option<R> {
        let mut round = self.round.take()?;
        let overlay = self.overlay.clone();
        let result = {
            let mut ctx = RoundContext::new(overlay.as_ref(), &mut self.send_queue, self.sink.clone());
            f(round.as_mut(), &mut ctx)
        };
        self.round = Some(round);
        Some(result)
    }

    /// Starts the built round and announces it.
    pub(crate) fn start_round(&mut self) -> Result<(), LocalError> {
        let round_id = self
            .round_id
            .clone()
            .ok_or_else(|| LocalError::new("no epoch negotiated"))?;
        self.events.push_back(SessionEvent::RoundStarting { round_id });
        match self.with_round(|round, ctx| round.start(ctx)) {
            Some(result) => result,
            None => Err(LocalError::new("no round to start")),
        }
    }

    /// Forwards an in-round data packet to the round, enforcing the epoch
    /// binding.
    pub(crate) fn process_round_data(&mut self, from: &PeerId, data: &SessionData) -> Result<(), Rejection> {
        match &self.round_id {
            Some(round_id) if round_id == data.round_id() => {}
            _ => return Err(Rejection::new("session data for a different epoch")),
        }
        match self.with_round(|round, ctx| round.process_packet(ctx, from, data.data())) {
            Some(result) => result,
            None => Err(Rejection::new("no round in progress")),
        }
    }

    /// Lets the round react to a dropped participant.
    pub(crate) fn round_disconnect(&mut self, peer: &PeerId) {
        let _ = self.with_round(|round, ctx| round.handle_disconnect(ctx, peer));
    }

    /// The hash the epoch's register list is signed under.
    pub(crate) fn hash_register_bytes(bytes: &[u8]) -> Box<[u8]> {
        SP::Digest::digest(bytes).as_slice().into()
    }
}
