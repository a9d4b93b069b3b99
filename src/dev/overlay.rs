use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet, VecDeque},
    rc::Rc,
    vec,
    vec::Vec,
};
use core::cell::{Cell, RefCell};
use core::fmt;

use tracing::trace;

use crate::identity::PeerId;
use crate::overlay::{Clock, Overlay};
use crate::wire::MessageType;

/// A controllable time source for virtual-time tests.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock(Rc<Cell<i64>>);

impl VirtualClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, ms: i64) {
        self.0.set(self.0.get() + ms);
    }

    /// Sets the clock to an absolute time; never moves it backwards.
    pub fn set(&self, now_ms: i64) {
        if now_ms > self.0.get() {
            self.0.set(now_ms);
        }
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.0.get()
    }
}

/// One notification in flight.
#[derive(Clone)]
pub struct Delivery {
    /// The sending participant.
    pub from: PeerId,
    /// The receiving participant.
    pub to: PeerId,
    /// The overlay method the packet is for.
    pub message_type: MessageType,
    /// The packet bytes.
    pub packet: Box<[u8]>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("message_type", &self.message_type)
            .field("bytes", &self.packet.len())
            .finish()
    }
}

struct HubInner {
    servers: Vec<PeerId>,
    participants: BTreeSet<PeerId>,
    links: BTreeMap<PeerId, BTreeSet<PeerId>>,
    queue: VecDeque<Delivery>,
}

/// A deterministic in-memory overlay: a single FIFO of in-flight
/// notifications, a connection table, and routed broadcasts.
///
/// Every participant is considered connected to itself; broadcasts reach
/// everything reachable through the link graph, the way a relaying overlay
/// would deliver them.
#[derive(Clone)]
pub struct Hub {
    inner: Rc<RefCell<HubInner>>,
}

impl Hub {
    /// Creates a hub for the given server roster.
    pub fn new(mut servers: Vec<PeerId>) -> Self {
        servers.sort();
        Self {
            inner: Rc::new(RefCell::new(HubInner {
                servers,
                participants: BTreeSet::new(),
                links: BTreeMap::new(),
                queue: VecDeque::new(),
            })),
        }
    }

    /// Registers a participant and returns its overlay handle.
    pub fn overlay(&self, local: PeerId) -> TestOverlay {
        let mut inner = self.inner.borrow_mut();
        inner.participants.insert(local);
        inner.links.entry(local).or_default().insert(local);
        TestOverlay {
            inner: self.inner.clone(),
            servers: inner.servers.clone(),
            local,
        }
    }

    /// Connects two participants (both directions).
    pub fn link(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.borrow_mut();
        inner.links.entry(a).or_default().insert(b);
        inner.links.entry(b).or_default().insert(a);
    }

    /// Severs the connection between two participants.
    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(peers) = inner.links.get_mut(a) {
            peers.remove(b);
        }
        if let Some(peers) = inner.links.get_mut(b) {
            peers.remove(a);
        }
    }

    /// Removes a participant entirely, returning the peers it was connected
    /// to (so disconnect events can be delivered).
    pub fn remove(&self, id: &PeerId) -> Vec<PeerId> {
        let mut inner = self.inner.borrow_mut();
        inner.participants.remove(id);
        let peers = inner
            .links
            .remove(id)
            .map(|peers| peers.into_iter().filter(|peer| peer != id).collect())
            .unwrap_or_default();
        for peers_of in inner.links.values_mut() {
            peers_of.remove(id);
        }
        peers
    }

    /// Pops the next deliverable notification.
    ///
    /// Notifications addressed to removed participants are dropped.
    pub fn pop(&self) -> Option<Delivery> {
        let mut inner = self.inner.borrow_mut();
        while let Some(delivery) = inner.queue.pop_front() {
            if inner.participants.contains(&delivery.to) {
                return Some(delivery);
            }
            trace!(?delivery, "dropping a notification to a removed participant");
        }
        None
    }

    /// Enqueues an arbitrary notification; lets tests inject replays.
    pub fn inject(&self, delivery: Delivery) {
        self.inner.borrow_mut().queue.push_back(delivery);
    }

    /// The number of notifications in flight.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Hub")
            .field("participants", &inner.participants.len())
            .field("pending", &inner.queue.len())
            .finish()
    }
}

/// One participant's view of the [`Hub`].
#[derive(Clone)]
pub struct TestOverlay {
    inner: Rc<RefCell<HubInner>>,
    servers: Vec<PeerId>,
    local: PeerId,
}

impl Overlay for TestOverlay {
    fn local_id(&self) -> PeerId {
        self.local
    }

    fn server_ids(&self) -> &[PeerId] {
        &self.servers
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .borrow()
            .links
            .get(&self.local)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send_to(&self, to: &PeerId, message_type: MessageType, packet: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        let linked = inner
            .links
            .get(&self.local)
            .map(|peers| peers.contains(to))
            .unwrap_or(false);
        if !linked {
            trace!(from = ?self.local, ?to, %message_type, "dropping a send to an unconnected peer");
            return;
        }
        inner.queue.push_back(Delivery {
            from: self.local,
            to: *to,
            message_type,
            packet: packet.into(),
        });
    }

    fn broadcast(&self, message_type: MessageType, packet: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        // Routed flood: everything reachable through the link graph.
        let mut reached = BTreeSet::new();
        let mut frontier = vec![self.local];
        reached.insert(self.local);
        while let Some(node) = frontier.pop() {
            if let Some(peers) = inner.links.get(&node) {
                for peer in peers {
                    if reached.insert(*peer) {
                        frontier.push(*peer);
                    }
                }
            }
        }
        for peer in &reached {
            inner.queue.push_back(Delivery {
                from: self.local,
                to: *peer,
                message_type,
                packet: packet.into(),
            });
        }
    }
}

impl fmt::Debug for TestOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestOverlay").field("local", &self.local).finish()
    }
}
