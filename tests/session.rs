//! End-to-end session scenarios on the in-memory overlay under virtual time.

use std::collections::{BTreeMap, BTreeSet};

use rand_core::{RngCore, SeedableRng};

use conclave::dev::{Delivery, Network, TestSessionParams};
use conclave::identity::{PeerId, RoundId};
use conclave::session::{SessionEvent, SessionHandle};
use conclave::wire::{MessageType, ServerInit};

const MAX_STEPS: usize = 5_000_000;

fn round_ids_started(network: &Network, id: &PeerId) -> Vec<RoundId> {
    network
        .node(id)
        .expect("participant exists")
        .events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::RoundStarting { round_id } => Some(round_id.clone()),
            _ => None,
        })
        .collect()
}

/// Enqueues one fresh random payload per client, runs until every
/// participant finishes one more successful round, and checks that every
/// sink received exactly the payloads of this pass.
fn send_test(network: &mut Network, rng: &mut rand_chacha::ChaCha8Rng) {
    for node in &network.nodes {
        node.sink.borrow_mut().clear();
    }

    let mut messages = Vec::new();
    for client in network.client_ids() {
        let mut message = [0u8; 128];
        rng.fill_bytes(&mut message);
        network.send_from(&client, &message);
        messages.push(message);
    }

    // A round may already be in flight with its payload pulled before these
    // sends were queued, so wait for the payloads themselves to land.
    let expected = messages.len();
    network
        .run_until(
            |network| {
                network
                    .nodes
                    .iter()
                    .all(|node| node.sink.borrow().messages.len() >= expected)
            },
            MAX_STEPS,
        )
        .expect("an epoch delivers the payloads");

    for node in &network.nodes {
        let sink = node.sink.borrow();
        assert_eq!(
            sink.messages.len(),
            messages.len(),
            "sink of {:?} has the wrong number of deliveries",
            node.id
        );
        for message in &messages {
            assert!(sink.contains(message), "sink of {:?} is missing a payload", node.id);
        }
    }
}

#[test]
fn ten_servers_no_clients_five_epochs() {
    let mut network = Network::new(1, 10, 0).unwrap();
    network.start().unwrap();

    for epoch in 1..=5usize {
        network
            .run_until(
                |network| network.nodes.iter().all(|node| node.finished_rounds(true) >= epoch),
                MAX_STEPS,
            )
            .unwrap();
    }

    // No application data was sent, so no sink received anything.
    for node in &network.nodes {
        assert!(node.sink.borrow().messages.is_empty());
    }

    // Every epoch derived a fresh round id.
    let first = network.server_ids()[0];
    let round_ids = round_ids_started(&network, &first);
    assert!(round_ids.len() >= 5);
    let unique: BTreeSet<&RoundId> = round_ids.iter().collect();
    assert_eq!(unique.len(), round_ids.len());
}

#[test]
fn one_server_ten_clients_delivers_everything() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(22);
    let mut network = Network::new(2, 1, 10).unwrap();
    network.start().unwrap();
    send_test(&mut network, &mut rng);
}

#[test]
fn ten_servers_hundred_clients_delivers_everything() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(33);
    let mut network = Network::new(3, 10, 100).unwrap();
    network.start().unwrap();
    send_test(&mut network, &mut rng);
}

#[test]
fn hard_server_crash_and_rejoin() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(44);
    let mut network = Network::new(4, 10, 10).unwrap();
    network.start().unwrap();

    send_test(&mut network, &mut rng);
    send_test(&mut network, &mut rng);

    // Hard-kill one server, wait, then bring it back with the same identity
    // and keys.
    let victim = network.server_ids()[3];
    network.crash(&victim).unwrap();
    network.settle(MAX_STEPS).unwrap();
    network.clock.advance(60_000);
    network.revive(victim, true).unwrap();

    // The next epoch must reach a running round on every participant.
    let baseline: BTreeMap<PeerId, usize> = network
        .nodes
        .iter()
        .map(|node| (node.id, node.started_rounds()))
        .collect();
    network
        .run_until(
            |network| {
                network
                    .nodes
                    .iter()
                    .all(|node| node.started_rounds() > baseline[&node.id])
            },
            MAX_STEPS,
        )
        .unwrap();

    // And payload delivery still works end to end.
    send_test(&mut network, &mut rng);
}

#[test]
fn soft_disconnect_storm_recovers_without_losing_sends() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(55);
    let mut network = Network::new(5, 10, 10).unwrap();
    network.start().unwrap();

    // First pass: enqueue one payload per client and wait until every
    // participant is mid-round.
    for node in &network.nodes {
        node.sink.borrow_mut().clear();
    }
    let mut messages = Vec::new();
    for client in network.client_ids() {
        let mut message = [0u8; 128];
        rng.fill_bytes(&mut message);
        network.send_from(&client, &message);
        messages.push(message);
    }
    network
        .run_until(
            |network| network.nodes.iter().all(|node| node.started_rounds() >= 1),
            MAX_STEPS,
        )
        .unwrap();

    // Sever a subset of links to one victim server mid-round; the affected
    // sessions restart, the rest drain the epoch.
    let servers = network.server_ids();
    let victim = servers[7];
    let severed = [servers[1], servers[4], servers[8]];
    for peer in &severed {
        network.sever(&victim, peer).unwrap();
    }
    network.settle(MAX_STEPS).unwrap();

    // Every client's payload was delivered despite the storm.
    for client in network.client_ids() {
        let sink = network.node(&client).unwrap().sink.borrow();
        for message in &messages {
            assert!(sink.contains(message));
        }
    }

    // Rejoin and prove the network still delivers fresh payloads everywhere,
    // the previously severed servers included.
    for peer in &severed {
        network.reconnect(&victim, peer).unwrap();
    }
    send_test(&mut network, &mut rng);
}

#[test]
fn stale_init_replay_is_dropped() {
    let mut network = Network::new(6, 3, 0).unwrap();
    network.start().unwrap();

    network
        .run_until(
            |network| network.nodes.iter().all(|node| node.finished_rounds(true) >= 1),
            MAX_STEPS,
        )
        .unwrap();
    // Drain to the next quiet point (a registration window).
    network.settle(MAX_STEPS).unwrap();

    let proposer = network.server_ids()[0];
    let target = network.server_ids()[1];
    let signer = network.signer_of(&proposer).unwrap();

    // A validly signed announcement from a long-gone epoch.
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(77);
    let stale = ServerInit::new::<TestSessionParams>(&mut rng, &signer, proposer, 0).unwrap();

    let state_before = network.node(&target).unwrap().session.state_name();
    let events_before = network.node(&target).unwrap().events.len();

    network.hub.inject(Delivery {
        from: proposer,
        to: target,
        message_type: MessageType::Init,
        packet: stale.to_packet().unwrap(),
    });
    network.settle(MAX_STEPS).unwrap();

    let node = network.node(&target).unwrap();
    assert_eq!(node.session.state_name(), state_before);
    assert_eq!(node.events.len(), events_before);
}
