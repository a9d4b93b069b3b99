//! The client session: server selection, queue/register handshake, and
//! round participation.

use alloc::{
    boxed::Box,
    collections::BTreeSet,
    format,
    rc::Rc,
    string::String,
    vec::Vec,
};
use core::cell::RefCell;
use core::fmt;

use rand_core::CryptoRngCore;
use tracing::{debug, warn};

use crate::errors::{LocalError, Rejection, StateError};
use crate::identity::{KeyDirectory, PeerId};
use crate::machine::{ProcessResult, State, StateMachine};
use crate::overlay::{Clock, Overlay};
use crate::round::{CreateRound, Sink};
use crate::wire::{ClientQueue, ClientRegister, MessageType, SessionMessage, NONCE_SIZE};

use super::params::SessionParameters;
use super::shared::SessionCore;
use super::{SessionEvent, SessionHandle};

/// The states of the client state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientStateKey {
    /// Not yet started.
    Offline,
    /// Waiting for a connection to some server.
    WaitingForServer,
    /// Asked the upstream server to be admitted, awaiting `Queued`.
    Queuing,
    /// Registered for the epoch, awaiting `Start`.
    Registering,
    /// A round is in progress.
    Communicating,
}

pub(crate) struct ClientSharedState<SP: SessionParameters> {
    pub(crate) core: SessionCore<SP>,
    server: Option<PeerId>,
    nonce: Box<[u8]>,
}

impl<SP: SessionParameters> ClientSharedState<SP> {
    fn new(core: SessionCore<SP>) -> Self {
        Self {
            core,
            server: None,
            nonce: Box::from([]),
        }
    }

    fn clear_epoch(&mut self) {
        self.core.clear_epoch();
        self.server = None;
        self.nonce = Box::from([]);
    }

    fn upstream(&self) -> Result<PeerId, Rejection> {
        self.server.ok_or_else(|| Rejection::new("no upstream server selected"))
    }

    /// Picks the first connected server, if any.
    fn select_server(&mut self) -> Option<PeerId> {
        let server = self
            .core
            .overlay
            .connected_peers()
            .into_iter()
            .find(|id| self.core.overlay.is_server(id));
        self.server = server;
        server
    }

    fn restart_on_stop(&self, message: &SessionMessage) -> bool {
        matches!(message, SessionMessage::Stop(stop) if self.core.valid_stop(stop))
    }

    fn send_queue_request(&mut self) -> Result<(), StateError> {
        let server = self.upstream()?;
        let mut nonce = [0u8; NONCE_SIZE];
        self.core.rng.fill_bytes(&mut nonce);
        self.nonce = Box::from(nonce);
        let queue = ClientQueue::new(self.nonce.clone());
        let packet = queue.to_packet()?;
        debug!(local = ?self.core.local_id(), ?server, "queuing with the upstream server");
        self.core.overlay.send_to(&server, MessageType::Queue, &packet);
        Ok(())
    }

    fn send_register(&mut self) -> Result<(), StateError> {
        let server = self.upstream()?;
        self.core.generate_round_data();
        let round_id = self
            .core
            .round_id
            .clone()
            .ok_or_else(|| LocalError::new("registering without an adopted epoch"))?;
        let round_key = self.core.round_key_public()?;
        let exchange = self.core.exchange_public()?;
        let local = self.core.local_id();
        let register = ClientRegister::new::<SP>(self.core.rng.as_mut(), &self.core.signer, local, round_id, round_key, exchange)?;
        let packet = register.to_packet()?;
        debug!(local = ?self.core.local_id(), ?server, "registering");
        self.core.overlay.send_to(&server, MessageType::Register, &packet);
        Ok(())
    }
}

struct Offline;

impl<SP: SessionParameters> State<ClientStateKey, ClientSharedState<SP>> for Offline {
    fn process_packet(
        &mut self,
        _shared: &mut ClientSharedState<SP>,
        _from: &PeerId,
        _message: SessionMessage,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        Ok(ProcessResult::Ignore)
    }

    fn store_packet(&self, _shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Queued)
    }
}

struct WaitingForServer;

impl<SP: SessionParameters> State<ClientStateKey, ClientSharedState<SP>> for WaitingForServer {
    fn init(&mut self, shared: &mut ClientSharedState<SP>) -> Result<ProcessResult<ClientStateKey>, StateError> {
        shared.clear_epoch();
        if shared.select_server().is_some() {
            Ok(ProcessResult::NextState)
        } else {
            debug!(local = ?shared.core.local_id(), "waiting for a server connection");
            Ok(ProcessResult::NoChange)
        }
    }

    fn process_packet(
        &mut self,
        _shared: &mut ClientSharedState<SP>,
        _from: &PeerId,
        _message: SessionMessage,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        Ok(ProcessResult::Ignore)
    }

    fn store_packet(&self, _shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Queued)
    }

    fn restart_packet(&self, shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_connection(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        if shared.core.overlay.is_server(peer) && shared.select_server().is_some() {
            Ok(ProcessResult::NextState)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }
}

struct Queuing;

impl<SP: SessionParameters> State<ClientStateKey, ClientSharedState<SP>> for Queuing {
    fn init(&mut self, shared: &mut ClientSharedState<SP>) -> Result<ProcessResult<ClientStateKey>, StateError> {
        shared.send_queue_request()?;
        Ok(ProcessResult::NoChange)
    }

    fn process_packet(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        let SessionMessage::Queued(queued) = message else {
            return Ok(ProcessResult::Ignore);
        };
        let server = shared.upstream()?;
        if *from != server {
            return Err(Rejection::new(format!("Queued from {from:?}, expected the upstream server")).into());
        }

        let key = shared.core.directory.key_of(&server)?;
        if !queued.verify::<SP>(key) {
            return Err(Rejection::new("invalid signature on Queued").into());
        }
        if queued.nonce() != shared.nonce.as_ref() {
            return Err(Rejection::new("Queued does not echo our nonce").into());
        }

        let agrees = queued.agrees();
        let server_ids = shared.core.overlay.server_ids().to_vec();
        if agrees.len() != server_ids.len() {
            return Err(Rejection::new("wrong number of Agree messages in Queued").into());
        }
        let senders: BTreeSet<PeerId> = agrees.iter().map(|agree| *agree.sender()).collect();
        if senders != server_ids.iter().copied().collect() {
            return Err(Rejection::new("Agree set in Queued does not match the server roster").into());
        }

        let round_id = agrees
            .first()
            .map(|agree| agree.round_id().clone())
            .ok_or_else(|| Rejection::new("empty Agree set in Queued"))?;
        if round_id.is_empty() {
            return Err(Rejection::new("empty round id in Queued").into());
        }
        shared.core.round_id = Some(round_id);
        for agree in agrees {
            shared.core.check_server_agree(agree)?;
        }
        shared.core.server_list = agrees.to_vec();
        debug!(local = ?shared.core.local_id(), "adopted the epoch");
        Ok(ProcessResult::NextState)
    }

    fn restart_packet(&self, shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        if Some(*peer) == shared.server {
            warn!(local = ?shared.core.local_id(), "upstream server disconnected");
            Ok(ProcessResult::Restart)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }
}

struct Registering;

impl<SP: SessionParameters> State<ClientStateKey, ClientSharedState<SP>> for Registering {
    fn init(&mut self, shared: &mut ClientSharedState<SP>) -> Result<ProcessResult<ClientStateKey>, StateError> {
        shared.send_register()?;
        Ok(ProcessResult::NoChange)
    }

    fn process_packet(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        _from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        let SessionMessage::Start(start) = message else {
            return Ok(ProcessResult::Ignore);
        };

        let server_ids = shared.core.overlay.server_ids().to_vec();
        if start.signatures().len() != server_ids.len() {
            return Err(Rejection::new("wrong number of signatures in Start").into());
        }
        let hash = SessionCore::<SP>::hash_register_bytes(start.register_bytes());
        for (id, signature) in server_ids.iter().zip(start.signatures()) {
            let key = shared.core.directory.key_of(id)?;
            if !crate::wire::verify_bytes::<SP>(key, &hash, signature) {
                return Err(Rejection::new(format!("invalid Start signature from {id:?}")).into());
            }
        }

        shared.core.client_list = start.registers().to_vec();
        shared.core.build_round()?;
        debug!(local = ?shared.core.local_id(), "roster released, communicating");
        Ok(ProcessResult::NextState)
    }

    fn store_packet(&self, _shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        matches!(message.message_type(), MessageType::Data)
    }

    fn restart_packet(&self, shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        if Some(*peer) == shared.server {
            warn!(local = ?shared.core.local_id(), "upstream server disconnected");
            Ok(ProcessResult::Restart)
        } else {
            Ok(ProcessResult::NoChange)
        }
    }
}

struct Communicating;

impl<SP: SessionParameters> State<ClientStateKey, ClientSharedState<SP>> for Communicating {
    fn init(&mut self, shared: &mut ClientSharedState<SP>) -> Result<ProcessResult<ClientStateKey>, StateError> {
        shared.core.start_round()?;
        Ok(ProcessResult::NoChange)
    }

    fn process_packet(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        let SessionMessage::Data(data) = message else {
            return Ok(ProcessResult::Ignore);
        };
        shared.core.process_round_data(from, &data)?;
        Ok(ProcessResult::NoChange)
    }

    fn restart_packet(&self, shared: &ClientSharedState<SP>, message: &SessionMessage) -> bool {
        shared.restart_on_stop(message)
    }

    fn handle_disconnection(
        &mut self,
        shared: &mut ClientSharedState<SP>,
        peer: &PeerId,
    ) -> Result<ProcessResult<ClientStateKey>, StateError> {
        if Some(*peer) == shared.server {
            warn!(local = ?shared.core.local_id(), "upstream server disconnected mid-round");
            Ok(ProcessResult::Restart)
        } else {
            shared.core.round_disconnect(peer);
            Ok(ProcessResult::NoChange)
        }
    }
}

/// A client participant's session.
pub struct ClientSession<SP: SessionParameters> {
    machine: StateMachine<ClientStateKey, ClientSharedState<SP>>,
    shared: ClientSharedState<SP>,
    stopped: bool,
}

impl<SP: SessionParameters> ClientSession<SP> {
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
        let core = SessionCore::new(rng, overlay, clock, signer, directory, create_round);
        let mut shared = ClientSharedState::new(core);

        let mut machine = StateMachine::new();
        machine.add_state(ClientStateKey::Offline, None, || Box::new(Offline));
        machine.add_state(ClientStateKey::WaitingForServer, None, || Box::new(WaitingForServer));
        machine.add_state(ClientStateKey::Queuing, Some(MessageType::Queued), || Box::new(Queuing));
        machine.add_state(ClientStateKey::Registering, Some(MessageType::Start), || {
            Box::new(Registering)
        });
        machine.add_state(ClientStateKey::Communicating, Some(MessageType::Data), || {
            Box::new(Communicating)
        });

        machine.add_transition(ClientStateKey::Offline, ClientStateKey::WaitingForServer);
        machine.add_transition(ClientStateKey::WaitingForServer, ClientStateKey::Queuing);
        machine.add_transition(ClientStateKey::Queuing, ClientStateKey::Registering);
        machine.add_transition(ClientStateKey::Registering, ClientStateKey::Communicating);
        machine.add_transition(ClientStateKey::Communicating, ClientStateKey::WaitingForServer);

        machine.set_initial_state(ClientStateKey::WaitingForServer);
        machine.set_state(&mut shared, ClientStateKey::Offline)?;

        Ok(Self {
            machine,
            shared,
            stopped: false,
        })
    }

    /// The current state, for diagnostics and tests.
    pub fn state(&self) -> Option<ClientStateKey> {
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

impl<SP: SessionParameters> SessionHandle for ClientSession<SP> {
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
        None
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.machine.current_state())
    }
}

impl<SP: SessionParameters> fmt::Debug for ClientSession<SP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.machine.current_state())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
