//! A generic message-driven finite state machine.
//!
//! The driver holds one current state and a registry of state factories.
//! Every inbound message is first *classified* by the current state (process
//! it now, defer it for a future state, force a restart of the epoch, or
//! drop it) and then dispatched accordingly. Deferred messages
//! are replayed in arrival order after every transition, which is how the
//! protocol tolerates out-of-order delivery without any global ordering.

use alloc::{
    boxed::Box,
    collections::{BTreeMap, BTreeSet, VecDeque},
    format,
};
use core::fmt::Debug;
use core::mem;

use tracing::{debug, trace, warn};

use crate::errors::{LocalError, StateError};
use crate::identity::PeerId;
use crate::wire::{MessageType, SessionMessage};

/// What the current state wants done with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// The message matches the state's expected type; process it now.
    Process,
    /// The message is expected by a future state; buffer it.
    Store,
    /// The message forces a return to the initial epoch state.
    Restart,
    /// The message is not interesting; drop it.
    Ignore,
}

/// The outcome of a state hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult<K> {
    /// Stay in the current state.
    NoChange,
    /// Follow the default registered transition.
    NextState,
    /// Follow a specific registered transition.
    ToState(K),
    /// Return to the initial epoch state.
    Restart,
    /// Nothing was done with the input.
    Ignore,
}

/// One state of a session state machine.
///
/// All session data lives in the shared record `S`; states are created fresh
/// by their factory at every entry and carry no fields of their own.
pub trait State<K: Copy, S> {
    /// Called when the machine enters this state.
    fn init(&mut self, _shared: &mut S) -> Result<ProcessResult<K>, StateError> {
        Ok(ProcessResult::NoChange)
    }

    /// Classifies an inbound message; `expected` is the message type this
    /// state was registered with.
    fn check_packet(&self, shared: &S, expected: Option<MessageType>, message: &SessionMessage) -> PacketKind {
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

    /// Handles a message classified as [`PacketKind::Process`].
    fn process_packet(
        &mut self,
        shared: &mut S,
        from: &PeerId,
        message: SessionMessage,
    ) -> Result<ProcessResult<K>, StateError>;

    /// Returns `true` for messages a future state expects.
    fn store_packet(&self, _shared: &S, _message: &SessionMessage) -> bool {
        false
    }

    /// Returns `true` for messages that force an epoch restart.
    ///
    /// Implementations must authenticate the message before answering
    /// `true`; a restart is an authoritative action.
    fn restart_packet(&self, _shared: &S, _message: &SessionMessage) -> bool {
        false
    }

    /// Called when a connection to `peer` comes up.
    fn handle_connection(&mut self, _shared: &mut S, _peer: &PeerId) -> Result<ProcessResult<K>, StateError> {
        Ok(ProcessResult::NoChange)
    }

    /// Called when the connection to `peer` goes down.
    fn handle_disconnection(&mut self, _shared: &mut S, _peer: &PeerId) -> Result<ProcessResult<K>, StateError> {
        Ok(ProcessResult::NoChange)
    }

    /// Called when the armed timer expires.
    fn handle_timeout(&mut self, _shared: &mut S) -> Result<ProcessResult<K>, StateError> {
        Ok(ProcessResult::NoChange)
    }
}

/// A factory producing a fresh state instance at every entry.
pub type StateFactory<K, S> = fn() -> Box<dyn State<K, S>>;

struct StateEntry<K, S> {
    message_type: Option<MessageType>,
    factory: StateFactory<K, S>,
}

/// The state-machine driver.
///
/// The driver does not own the shared record; every entry point borrows it,
/// so the caller stays free to inspect it between events.
pub struct StateMachine<K: Copy + Ord + Debug, S> {
    states: BTreeMap<K, StateEntry<K, S>>,
    default_edges: BTreeMap<K, K>,
    edges: BTreeSet<(K, K)>,
    initial: Option<K>,
    current_key: Option<K>,
    current: Option<Box<dyn State<K, S>>>,
    deferred: VecDeque<(PeerId, SessionMessage)>,
}

impl<K: Copy + Ord + Debug, S> StateMachine<K, S> {
    /// Creates an empty machine.
    pub fn new() -> Self {
        Self {
            states: BTreeMap::new(),
            default_edges: BTreeMap::new(),
            edges: BTreeSet::new(),
            initial: None,
            current_key: None,
            current: None,
            deferred: VecDeque::new(),
        }
    }

    /// Registers a state under `key`, along with the message type it
    /// processes (if any).
    pub fn add_state(&mut self, key: K, message_type: Option<MessageType>, factory: StateFactory<K, S>) {
        self.states.insert(key, StateEntry { message_type, factory });
    }

    /// Declares a permitted transition.
    ///
    /// The first edge registered for `from` becomes its default, followed
    /// on [`ProcessResult::NextState`].
    pub fn add_transition(&mut self, from: K, to: K) {
        self.default_edges.entry(from).or_insert(to);
        self.edges.insert((from, to));
    }

    /// Declares the state entered on [`ProcessResult::Restart`].
    pub fn set_initial_state(&mut self, key: K) {
        self.initial = Some(key);
    }

    /// The key of the current state, if any.
    pub fn current_state(&self) -> Option<K> {
        self.current_key
    }

    /// Installs the state registered under `key` and runs its `init` hook.
    pub fn set_state(&mut self, shared: &mut S, key: K) -> Result<(), LocalError> {
        self.enter(shared, key)
    }

    /// Classifies and dispatches an inbound message.
    pub fn process_packet(&mut self, shared: &mut S, from: PeerId, message: SessionMessage) -> Result<(), LocalError> {
        self.feed(shared, from, message, true)
    }

    /// Follows the default transition out of the current state.
    pub fn state_complete(&mut self, shared: &mut S) -> Result<(), LocalError> {
        let current = self
            .current_key
            .ok_or_else(|| LocalError::new("no current state to complete"))?;
        let to = *self
            .default_edges
            .get(&current)
            .ok_or_else(|| LocalError::new(format!("no transition registered out of {current:?}")))?;
        self.enter(shared, to)
    }

    /// Forwards a connection event to the current state.
    pub fn handle_connection(&mut self, shared: &mut S, peer: &PeerId) -> Result<(), LocalError> {
        let result = match self.current.as_mut() {
            Some(state) => state.handle_connection(shared, peer),
            None => return Err(LocalError::new("no current state")),
        };
        self.absorb(shared, result)
    }

    /// Forwards a disconnection event to the current state.
    pub fn handle_disconnection(&mut self, shared: &mut S, peer: &PeerId) -> Result<(), LocalError> {
        let result = match self.current.as_mut() {
            Some(state) => state.handle_disconnection(shared, peer),
            None => return Err(LocalError::new("no current state")),
        };
        self.absorb(shared, result)
    }

    /// Forwards a timer expiration to the current state.
    pub fn handle_timeout(&mut self, shared: &mut S) -> Result<(), LocalError> {
        let result = match self.current.as_mut() {
            Some(state) => state.handle_timeout(shared),
            None => return Err(LocalError::new("no current state")),
        };
        self.absorb(shared, result)
    }

    fn feed(&mut self, shared: &mut S, from: PeerId, message: SessionMessage, allow_restart: bool) -> Result<(), LocalError> {
        let kind = match (self.current.as_ref(), self.current_key) {
            (Some(state), Some(key)) => {
                let expected = self.states.get(&key).and_then(|entry| entry.message_type);
                state.check_packet(shared, expected, &message)
            }
            _ => return Err(LocalError::new("no current state")),
        };

        match kind {
            PacketKind::Ignore => {
                trace!(?from, message_type = %message.message_type(), "dropping packet");
            }
            PacketKind::Store => {
                debug!(?from, message_type = %message.message_type(), "deferring packet");
                self.deferred.push_back((from, message));
            }
            PacketKind::Restart => {
                if allow_restart {
                    debug!(?from, message_type = %message.message_type(), "packet forces a restart");
                    self.restart(shared)?;
                    // The triggering message is re-classified exactly once
                    // against the fresh epoch state.
                    self.feed(shared, from, message, false)?;
                } else {
                    warn!(?from, "packet demanded a second restart in a row, dropping it");
                }
            }
            PacketKind::Process => {
                let result = match self.current.as_mut() {
                    Some(state) => state.process_packet(shared, &from, message),
                    None => return Err(LocalError::new("no current state")),
                };
                self.absorb(shared, result)?;
            }
        }
        Ok(())
    }

    fn absorb(&mut self, shared: &mut S, result: Result<ProcessResult<K>, StateError>) -> Result<(), LocalError> {
        match result {
            Ok(result) => self.apply(shared, result),
            Err(StateError::Rejection(rejection)) => {
                warn!(state = ?self.current_key, %rejection, "handler rejected the input");
                Ok(())
            }
            Err(StateError::Local(error)) => Err(error),
        }
    }

    fn apply(&mut self, shared: &mut S, result: ProcessResult<K>) -> Result<(), LocalError> {
        match result {
            ProcessResult::NoChange | ProcessResult::Ignore => Ok(()),
            ProcessResult::NextState => self.state_complete(shared),
            ProcessResult::ToState(to) => {
                let current = self
                    .current_key
                    .ok_or_else(|| LocalError::new("no current state to transition from"))?;
                if !self.edges.contains(&(current, to)) {
                    return Err(LocalError::new(format!(
                        "transition {current:?} -> {to:?} is not registered"
                    )));
                }
                self.enter(shared, to)
            }
            ProcessResult::Restart => self.restart(shared),
        }
    }

    fn restart(&mut self, shared: &mut S) -> Result<(), LocalError> {
        let initial = self
            .initial
            .ok_or_else(|| LocalError::new("no initial state registered"))?;
        debug!(from = ?self.current_key, "restarting the epoch");
        self.enter(shared, initial)
    }

    fn enter(&mut self, shared: &mut S, key: K) -> Result<(), LocalError> {
        let entry = self
            .states
            .get(&key)
            .ok_or_else(|| LocalError::new(format!("state {key:?} is not registered")))?;
        trace!(from = ?self.current_key, to = ?key, "state transition");
        self.current_key = Some(key);
        self.current = Some((entry.factory)());
        let result = match self.current.as_mut() {
            Some(state) => state.init(shared),
            None => return Err(LocalError::new("no current state")),
        };
        self.absorb(shared, result)?;
        self.drain(shared)
    }

    fn drain(&mut self, shared: &mut S) -> Result<(), LocalError> {
        // Deferred messages are replayed against whatever state is current
        // by the time each of them is re-fed; a replay may itself cause
        // further transitions, whose own drains see an empty buffer.
        let deferred = mem::take(&mut self.deferred);
        for (from, message) in deferred {
            self.feed(shared, from, message, true)?;
        }
        Ok(())
    }

    /// The number of messages currently deferred.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

impl<K: Copy + Ord + Debug, S> Default for StateMachine<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Ord + Debug, S> Debug for StateMachine<K, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current_key)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    use super::{ProcessResult, State, StateMachine};
    use crate::errors::{Rejection, StateError};
    use crate::identity::{PeerId, RoundId};
    use crate::wire::{ClientQueue, MessageType, SessionData, SessionMessage};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Key {
        First,
        Second,
    }

    #[derive(Default)]
    struct Shared {
        processed: Vec<MessageType>,
        rejected: usize,
    }

    struct First;

    impl State<Key, Shared> for First {
        fn process_packet(
            &mut self,
            shared: &mut Shared,
            _from: &PeerId,
            message: SessionMessage,
        ) -> Result<ProcessResult<Key>, StateError> {
            shared.processed.push(message.message_type());
            Ok(ProcessResult::NextState)
        }

        fn store_packet(&self, _shared: &Shared, message: &SessionMessage) -> bool {
            message.message_type() == MessageType::Data
        }
    }

    struct Second;

    impl State<Key, Shared> for Second {
        fn process_packet(
            &mut self,
            shared: &mut Shared,
            _from: &PeerId,
            message: SessionMessage,
        ) -> Result<ProcessResult<Key>, StateError> {
            shared.rejected += 1;
            let _ = message;
            Err(Rejection::new("not accepted").into())
        }
    }

    fn machine() -> StateMachine<Key, Shared> {
        let mut machine = StateMachine::new();
        machine.add_state(Key::First, Some(MessageType::Queue), || Box::new(First));
        machine.add_state(Key::Second, Some(MessageType::Data), || Box::new(Second));
        machine.add_transition(Key::First, Key::Second);
        machine.set_initial_state(Key::First);
        machine
    }

    fn queue_message() -> SessionMessage {
        SessionMessage::Queue(ClientQueue::new(Box::from(*b"nonce")))
    }

    fn data_message() -> SessionMessage {
        SessionMessage::Data(SessionData::new(RoundId::empty(), Box::from(*b"payload")))
    }

    #[test]
    fn deferred_messages_replay_after_transition() {
        let mut machine = machine();
        let mut shared = Shared::default();
        machine.set_state(&mut shared, Key::First).unwrap();
        let from = PeerId::new([1; 16]);

        // Arrives early: the first state defers it.
        machine.process_packet(&mut shared, from, data_message()).unwrap();
        assert_eq!(machine.deferred_len(), 1);

        // The expected message transitions, and the deferred one is replayed
        // into the second state, whose handler rejects it without fallout.
        machine.process_packet(&mut shared, from, queue_message()).unwrap();
        assert_eq!(machine.current_state(), Some(Key::Second));
        assert_eq!(machine.deferred_len(), 0);
        assert_eq!(shared.processed, [MessageType::Queue]);
        assert_eq!(shared.rejected, 1);
    }

    #[test]
    fn rejection_does_not_change_state() {
        let mut machine = machine();
        let mut shared = Shared::default();
        machine.set_state(&mut shared, Key::Second).unwrap();
        let from = PeerId::new([2; 16]);

        machine.process_packet(&mut shared, from, data_message()).unwrap();
        assert_eq!(machine.current_state(), Some(Key::Second));
    }

    #[test]
    fn unclassified_messages_are_dropped() {
        let mut machine = machine();
        let mut shared = Shared::default();
        machine.set_state(&mut shared, Key::Second).unwrap();
        let from = PeerId::new([3; 16]);

        // The second state neither processes nor stores Queue.
        machine.process_packet(&mut shared, from, queue_message()).unwrap();
        assert_eq!(machine.current_state(), Some(Key::Second));
        assert_eq!(machine.deferred_len(), 0);
        assert!(shared.processed.is_empty());
    }

    #[test]
    fn missing_transition_is_a_local_error() {
        let mut machine = machine();
        let mut shared = Shared::default();
        machine.set_state(&mut shared, Key::Second).unwrap();
        assert!(machine.state_complete(&mut shared).is_err());
    }

    #[test]
    fn unregistered_state_is_a_local_error() {
        let mut machine: StateMachine<Key, Shared> = StateMachine::new();
        let mut shared = Shared::default();
        assert!(machine.set_state(&mut shared, Key::First).is_err());
    }
}
