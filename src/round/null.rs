use alloc::{boxed::Box, format, string::String, vec, vec::Vec};

use tracing::{debug, warn};

use crate::errors::{LocalError, Rejection};
use crate::identity::{PeerId, RoundId};
use crate::session::SessionParameters;
use crate::wire::{MessageType, SessionData};

use super::{Round, RoundContext, RoundEnv, RoundStatus, DATA_CHUNK_SIZE};

/// The trivial round: everyone broadcasts one chunk of pending data and the
/// round finishes once a message has been collected from every roster
/// member. No anonymity is provided.
#[derive(Debug)]
pub struct NullRound {
    round_id: RoundId,
    local_id: PeerId,
    // Servers first, then clients; receive slots are positional.
    members: Vec<PeerId>,
    received: Vec<Option<Box<[u8]>>>,
    collected: usize,
    status: RoundStatus,
}

impl NullRound {
    /// The [`CreateRound`](`super::CreateRound`) factory for this round.
    pub fn create<SP: SessionParameters>(env: RoundEnv<SP>) -> Result<Box<dyn Round>, LocalError> {
        let members = env
            .servers
            .iter()
            .chain(env.clients.iter())
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        let received = vec![None; members.len()];
        Ok(Box::new(Self {
            round_id: env.round_id,
            local_id: env.ident.id,
            members,
            received,
            collected: 0,
            status: RoundStatus::Running,
        }))
    }

    fn finish(&mut self, successful: bool, reason: impl Into<String>) {
        if self.status.is_running() {
            self.status = RoundStatus::Finished {
                successful,
                reason: reason.into(),
            };
        }
    }
}

impl Round for NullRound {
    fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    fn start(&mut self, ctx: &mut RoundContext<'_>) -> Result<(), LocalError> {
        let (data, _more) = ctx.get_data(DATA_CHUNK_SIZE);
        let packet = SessionData::new(self.round_id.clone(), data).to_packet()?;
        ctx.overlay().broadcast(MessageType::Data, &packet);
        Ok(())
    }

    fn process_packet(&mut self, ctx: &mut RoundContext<'_>, from: &PeerId, data: &[u8]) -> Result<(), Rejection> {
        if !self.status.is_running() {
            return Err(Rejection::new("round already finished"));
        }

        let position = self
            .members
            .iter()
            .position(|id| id == from)
            .ok_or_else(|| Rejection::new(format!("{from:?} is not a round member")))?;

        if self.received[position].is_some() {
            // One message per member per round; repeats are dropped.
            warn!(?from, "second message from the same member, dropping it");
            return Ok(());
        }

        self.received[position] = Some(data.into());
        self.collected += 1;
        debug!(
            local = ?self.local_id,
            collected = self.collected,
            expected = self.received.len(),
            "collected a round message"
        );

        if self.collected != self.received.len() {
            return Ok(());
        }

        for message in self.received.iter().flatten() {
            if !message.is_empty() {
                ctx.push_data(message);
            }
        }
        self.finish(true, "round finished");
        Ok(())
    }

    fn handle_disconnect(&mut self, _ctx: &mut RoundContext<'_>, peer: &PeerId) {
        if self.members.contains(peer) && self.status.is_running() {
            self.finish(false, format!("{peer:?} disconnected"));
        }
    }

    fn stop(&mut self, reason: &str) {
        self.finish(false, reason);
    }

    fn status(&self) -> &RoundStatus {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, rc::Rc, vec, vec::Vec};
    use core::cell::RefCell;

    use rand_core::SeedableRng;

    use super::{NullRound, Round, RoundStatus};
    use crate::identity::{PeerId, RoundId};
    use crate::overlay::Overlay;
    use crate::round::{RoundContext, Sink};
    use crate::session::SendQueue;
    use crate::wire::MessageType;

    struct SilentOverlay {
        local: PeerId,
        servers: Vec<PeerId>,
    }

    impl Overlay for SilentOverlay {
        fn local_id(&self) -> PeerId {
            self.local
        }

        fn server_ids(&self) -> &[PeerId] {
            &self.servers
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            Vec::new()
        }

        fn send_to(&self, _to: &PeerId, _message_type: MessageType, _packet: &[u8]) {}

        fn broadcast(&self, _message_type: MessageType, _packet: &[u8]) {}
    }

    #[derive(Default)]
    struct Collected(Vec<Box<[u8]>>);

    impl Sink for Collected {
        fn push(&mut self, data: &[u8]) {
            self.0.push(data.into());
        }
    }

    fn make_round(members: &[PeerId]) -> NullRound {
        NullRound {
            round_id: RoundId::new(*b"round"),
            local_id: members[0],
            members: members.to_vec(),
            received: vec![None; members.len()],
            collected: 0,
            status: RoundStatus::Running,
        }
    }

    #[test]
    fn second_message_from_a_member_is_dropped() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let members = [PeerId::random(&mut rng), PeerId::random(&mut rng)];
        let mut round = make_round(&members);

        let overlay = SilentOverlay {
            local: members[0],
            servers: members.to_vec(),
        };
        let mut queue = SendQueue::default();
        let sink = Rc::new(RefCell::new(Collected::default()));
        let mut ctx = RoundContext::new(&overlay, &mut queue, Some(sink.clone()));

        round.process_packet(&mut ctx, &members[0], b"first").unwrap();
        round.process_packet(&mut ctx, &members[0], b"overwrite").unwrap();
        assert!(round.status().is_running());

        round.process_packet(&mut ctx, &members[1], b"second").unwrap();
        assert_eq!(
            *round.status(),
            RoundStatus::Finished {
                successful: true,
                reason: "round finished".into()
            }
        );

        // The repeat neither overwrote the slot nor counted towards the quorum.
        let delivered = sink.borrow().0.clone();
        assert_eq!(delivered, [Box::from(*b"first"), Box::from(*b"second")]);
    }

    #[test]
    fn empty_messages_count_but_are_not_delivered() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(2);
        let members = [PeerId::random(&mut rng), PeerId::random(&mut rng)];
        let mut round = make_round(&members);

        let overlay = SilentOverlay {
            local: members[0],
            servers: members.to_vec(),
        };
        let mut queue = SendQueue::default();
        let sink = Rc::new(RefCell::new(Collected::default()));
        let mut ctx = RoundContext::new(&overlay, &mut queue, Some(sink.clone()));

        round.process_packet(&mut ctx, &members[0], b"").unwrap();
        round.process_packet(&mut ctx, &members[1], b"payload").unwrap();
        assert!(!round.status().is_running());
        let delivered = sink.borrow().0.clone();
        assert_eq!(delivered, [Box::from(*b"payload")]);
    }

    #[test]
    fn member_disconnect_interrupts_the_round() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let members = [PeerId::random(&mut rng), PeerId::random(&mut rng)];
        let mut round = make_round(&members);

        let overlay = SilentOverlay {
            local: members[0],
            servers: members.to_vec(),
        };
        let mut queue = SendQueue::default();
        let mut ctx = RoundContext::new(&overlay, &mut queue, None);

        round.handle_disconnect(&mut ctx, &members[1]);
        match round.status() {
            RoundStatus::Finished { successful, .. } => assert!(!successful),
            RoundStatus::Running => panic!("round still running"),
        }
    }
}
