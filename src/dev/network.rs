use alloc::{
    boxed::Box,
    collections::BTreeMap,
    format,
    rc::Rc,
    vec::Vec,
};
use core::cell::RefCell;

use rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use signature::Keypair;

use crate::errors::LocalError;
use crate::identity::{KeyDirectory, PeerId};
use crate::round::{NullRound, Sink};
use crate::session::{ClientSession, ServerSession, SessionEvent, SessionHandle};

use super::overlay::{Hub, VirtualClock};
use super::session_parameters::{TestSessionParams, TestSigner};

/// A sink that just remembers everything it was handed.
#[derive(Debug, Default)]
pub struct BufferSink {
    /// The delivered messages, in delivery order.
    pub messages: Vec<Box<[u8]>>,
}

impl BufferSink {
    /// Returns `true` if `data` was delivered at some point.
    pub fn contains(&self, data: &[u8]) -> bool {
        self.messages.iter().any(|message| message.as_ref() == data)
    }

    /// Forgets everything delivered so far.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Sink for BufferSink {
    fn push(&mut self, data: &[u8]) {
        self.messages.push(data.into());
    }
}

/// One participant of a [`Network`].
pub struct TestNode {
    /// The participant identifier.
    pub id: PeerId,
    /// Whether this participant is a server.
    pub server: bool,
    /// The session under test.
    pub session: Box<dyn SessionHandle>,
    /// The sink collecting round deliveries.
    pub sink: Rc<RefCell<BufferSink>>,
    /// Every event the session has emitted so far.
    pub events: Vec<SessionEvent>,
    /// `false` once the participant has been crashed.
    pub alive: bool,
}

impl core::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TestNode")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("alive", &self.alive)
            .field("state", &self.session.state_name())
            .finish_non_exhaustive()
    }
}

impl TestNode {
    /// Counts the finished rounds, successful ones only if `successful_only`.
    pub fn finished_rounds(&self, successful_only: bool) -> usize {
        self.events
            .iter()
            .filter(|event| match event {
                SessionEvent::RoundFinished { successful, .. } => *successful || !successful_only,
                _ => false,
            })
            .count()
    }

    /// Counts the `RoundStarting` events.
    pub fn started_rounds(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, SessionEvent::RoundStarting { .. }))
            .count()
    }
}

/// An in-memory network of server and client sessions under virtual time.
///
/// Servers are fully meshed; every client is connected to every server.
/// Messages are pumped one at a time in FIFO order; when the network goes
/// quiet, the clock jumps to the earliest armed deadline.
pub struct Network {
    /// The message hub.
    pub hub: Hub,
    /// The shared virtual clock.
    pub clock: VirtualClock,
    /// All participants, servers first.
    pub nodes: Vec<TestNode>,
    signers: BTreeMap<PeerId, TestSigner>,
    directory: KeyDirectory<TestSessionParams>,
    seed_rng: ChaCha8Rng,
}

impl Network {
    /// Builds a network of `n_servers` servers and `n_clients` clients with
    /// fresh identities, fully connected, not yet started.
    pub fn new(seed: u64, n_servers: usize, n_clients: usize) -> Result<Self, LocalError> {
        let mut seed_rng = ChaCha8Rng::seed_from_u64(seed);
        let mut server_ids: Vec<PeerId> = (0..n_servers).map(|_| PeerId::random(&mut seed_rng)).collect();
        server_ids.sort();
        let client_ids: Vec<PeerId> = (0..n_clients).map(|_| PeerId::random(&mut seed_rng)).collect();

        let mut signers = BTreeMap::new();
        let mut keys = BTreeMap::new();
        for id in server_ids.iter().chain(client_ids.iter()) {
            let signer = TestSigner::new(seed_rng.next_u64());
            keys.insert(*id, signer.verifying_key());
            signers.insert(*id, signer);
        }

        let mut network = Self {
            hub: Hub::new(server_ids.clone()),
            clock: VirtualClock::new(),
            nodes: Vec::new(),
            signers,
            directory: KeyDirectory::new(keys),
            seed_rng,
        };

        for id in &server_ids {
            network.spawn(*id, true)?;
        }
        for id in &client_ids {
            network.spawn(*id, false)?;
        }

        // Full server mesh, and every client connected to every server.
        for (index, a) in server_ids.iter().enumerate() {
            for b in &server_ids[index + 1..] {
                network.hub.link(*a, *b);
            }
        }
        for client in &client_ids {
            for server in &server_ids {
                network.hub.link(*client, *server);
            }
        }

        Ok(network)
    }

    fn spawn(&mut self, id: PeerId, server: bool) -> Result<(), LocalError> {
        let overlay = Rc::new(self.hub.overlay(id));
        let clock = Rc::new(self.clock.clone());
        let rng = Box::new(ChaCha8Rng::seed_from_u64(self.seed_rng.next_u64()));
        let signer = *self
            .signers
            .get(&id)
            .ok_or_else(|| LocalError::new(format!("no signer for {id:?}")))?;

        let mut session: Box<dyn SessionHandle> = if server {
            Box::new(ServerSession::<TestSessionParams>::new(
                rng,
                overlay,
                clock,
                signer,
                self.directory.clone(),
                NullRound::create,
            )?)
        } else {
            Box::new(ClientSession::<TestSessionParams>::new(
                rng,
                overlay,
                clock,
                signer,
                self.directory.clone(),
                NullRound::create,
            )?)
        };

        let sink = Rc::new(RefCell::new(BufferSink::default()));
        session.set_sink(sink.clone());

        if let Some(node) = self.nodes.iter_mut().find(|node| node.id == id) {
            node.session = session;
            node.sink = sink;
            node.events = Vec::new();
            node.alive = true;
        } else {
            self.nodes.push(TestNode {
                id,
                server,
                session,
                sink,
                events: Vec::new(),
                alive: true,
            });
        }
        Ok(())
    }

    /// Starts every session.
    pub fn start(&mut self) -> Result<(), LocalError> {
        for node in &mut self.nodes {
            node.session.start()?;
        }
        self.collect_events();
        Ok(())
    }

    /// The server identifiers, ascending (roster order).
    pub fn server_ids(&self) -> Vec<PeerId> {
        self.nodes.iter().filter(|node| node.server).map(|node| node.id).collect()
    }

    /// The client identifiers.
    pub fn client_ids(&self) -> Vec<PeerId> {
        self.nodes.iter().filter(|node| !node.server).map(|node| node.id).collect()
    }

    /// Looks up a participant.
    pub fn node(&self, id: &PeerId) -> Option<&TestNode> {
        self.nodes.iter().find(|node| node.id == *id)
    }

    /// The long-term signer of a participant; lets tests forge traffic.
    pub fn signer_of(&self, id: &PeerId) -> Option<TestSigner> {
        self.signers.get(id).copied()
    }

    fn node_mut(&mut self, id: &PeerId) -> Option<&mut TestNode> {
        self.nodes.iter_mut().find(|node| node.id == *id)
    }

    /// Queues application data at a participant.
    pub fn send_from(&mut self, id: &PeerId, data: &[u8]) {
        if let Some(node) = self.node_mut(id) {
            node.session.send(data);
        }
    }

    fn collect_events(&mut self) {
        for node in &mut self.nodes {
            node.events.extend(node.session.drain_events());
        }
    }

    /// Delivers one in-flight notification; `false` when the network is
    /// quiet.
    pub fn deliver_one(&mut self) -> Result<bool, LocalError> {
        let Some(delivery) = self.hub.pop() else {
            return Ok(false);
        };
        if let Some(node) = self.node_mut(&delivery.to) {
            if node.alive {
                node.session
                    .incoming(delivery.from, delivery.message_type, &delivery.packet)?;
            }
        }
        self.collect_events();
        Ok(true)
    }

    /// Pumps deliveries and virtual time until `condition` holds.
    ///
    /// Fails if the network goes fully quiet (no messages, no deadlines) or
    /// the step budget runs out first.
    pub fn run_until(
        &mut self,
        mut condition: impl FnMut(&Self) -> bool,
        max_steps: usize,
    ) -> Result<(), LocalError> {
        for _ in 0..max_steps {
            if condition(self) {
                return Ok(());
            }
            if self.deliver_one()? {
                continue;
            }

            let deadline = self
                .nodes
                .iter()
                .filter(|node| node.alive)
                .filter_map(|node| node.session.next_deadline())
                .min();
            let Some(deadline) = deadline else {
                return Err(LocalError::new("the network went quiet before the condition held"));
            };
            self.clock.set(deadline);
            for node in &mut self.nodes {
                if node.alive {
                    node.session.tick()?;
                }
            }
            self.collect_events();
        }
        Err(LocalError::new("step budget exhausted before the condition held"))
    }

    /// Drains all in-flight notifications without advancing time.
    pub fn settle(&mut self, max_steps: usize) -> Result<(), LocalError> {
        for _ in 0..max_steps {
            if !self.deliver_one()? {
                return Ok(());
            }
        }
        Err(LocalError::new("step budget exhausted while settling"))
    }

    /// Hard-kills a participant: overlay teardown, session stop, disconnect
    /// events at every peer.
    pub fn crash(&mut self, id: &PeerId) -> Result<(), LocalError> {
        let peers = self.hub.remove(id);
        if let Some(node) = self.node_mut(id) {
            node.alive = false;
            node.session.stop("crashed");
        }
        for peer in peers {
            if let Some(node) = self.node_mut(&peer) {
                if node.alive {
                    node.session.handle_disconnection(*id)?;
                }
            }
        }
        self.collect_events();
        Ok(())
    }

    /// Re-instantiates a crashed participant with the same identity and
    /// keys, reconnects it, and starts it.
    pub fn revive(&mut self, id: PeerId, server: bool) -> Result<(), LocalError> {
        self.spawn(id, server)?;

        let others: Vec<(PeerId, bool)> = self
            .nodes
            .iter()
            .filter(|node| node.alive && node.id != id)
            .map(|node| (node.id, node.server))
            .collect();
        for (other, other_is_server) in others {
            // Servers connect to everyone; clients only to servers.
            if !server && !other_is_server {
                continue;
            }
            self.hub.link(id, other);
            if let Some(node) = self.node_mut(&other) {
                node.session.handle_connection(id)?;
            }
        }

        if let Some(node) = self.node_mut(&id) {
            node.session.start()?;
        }
        // Connection events on the revived side for the links established
        // above.
        let peers: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|node| node.alive && node.id != id && (server || node.server))
            .map(|node| node.id)
            .collect();
        for peer in peers {
            if let Some(node) = self.node_mut(&id) {
                node.session.handle_connection(peer)?;
            }
        }
        self.collect_events();
        Ok(())
    }

    /// Severs one link, delivering disconnect events to both ends.
    pub fn sever(&mut self, a: &PeerId, b: &PeerId) -> Result<(), LocalError> {
        self.hub.unlink(a, b);
        if let Some(node) = self.node_mut(a) {
            if node.alive {
                node.session.handle_disconnection(*b)?;
            }
        }
        if let Some(node) = self.node_mut(b) {
            if node.alive {
                node.session.handle_disconnection(*a)?;
            }
        }
        self.collect_events();
        Ok(())
    }

    /// Re-establishes one link, delivering connection events to both ends.
    pub fn reconnect(&mut self, a: &PeerId, b: &PeerId) -> Result<(), LocalError> {
        self.hub.link(*a, *b);
        if let Some(node) = self.node_mut(a) {
            if node.alive {
                node.session.handle_connection(*b)?;
            }
        }
        if let Some(node) = self.node_mut(b) {
            if node.alive {
                node.session.handle_connection(*a)?;
            }
        }
        self.collect_events();
        Ok(())
    }
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.nodes.len())
            .field("pending", &self.hub.pending())
            .finish_non_exhaustive()
    }
}
