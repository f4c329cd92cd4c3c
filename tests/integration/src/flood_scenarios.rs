//! Flooding, hop budget and dedup across real multi-node topologies

use crate::test_utils::{init_tracing, node_config, settle, wait_until, MeshChain, SETTLE_TIMEOUT};
use sonicwave_mesh::transports::{MemoryMedium, MemoryTransport};
use sonicwave_mesh::{Location, MeshNode, SosPacket, SosRequest, TransportKind, Urgency};
use std::sync::Arc;
use tokio::time::Duration;

fn accepted(node: &MeshNode, hash: &sonicwave_mesh::ContentHash) -> bool {
    node.engine().dedup().contains(hash).unwrap_or(false)
}

#[tokio::test]
async fn test_critical_packet_floods_chain() {
    init_tracing();
    let chain = MeshChain::new(5).await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("trapped under debris", Urgency::Critical))
        .unwrap();
    assert_eq!(ack.ttl_remaining, 20);

    let last = chain.node(4);
    assert!(wait_until(SETTLE_TIMEOUT, || accepted(last, &ack.content_hash)).await);

    let entry = last.engine().dedup().get(&ack.content_hash).unwrap().unwrap();
    assert_eq!(entry.best_known.hop_count, 3);
    assert_eq!(entry.best_known.ttl_remaining, 17);
    assert_eq!(entry.best_known.relay_path, vec!["N1", "N2", "N3"]);
    assert_eq!(entry.best_known.sender_id, "N0");

    settle().await;
    // Every relay forwarded exactly once and nothing came back as new
    for i in 1..4 {
        let stats = chain.node(i).stats().relay;
        assert_eq!(stats.accepted, 1, "N{} accepted", i);
        assert_eq!(stats.forwarded, 1, "N{} forwarded", i);
    }
    assert_eq!(chain.node(0).stats().relay.accepted, 0);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_hop_budget_exhausts_after_fifteen_relays() {
    init_tracing();
    let chain = MeshChain::new(18).await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("rising water", Urgency::High))
        .unwrap();
    assert_eq!(ack.ttl_remaining, 15);

    let n16 = chain.node(16);
    assert!(wait_until(SETTLE_TIMEOUT, || accepted(n16, &ack.content_hash)).await);
    settle().await;

    let entry = n16.engine().dedup().get(&ack.content_hash).unwrap().unwrap();
    assert_eq!(entry.best_known.ttl_remaining, 0);
    assert_eq!(entry.best_known.hop_count, 15);
    assert_eq!(entry.best_known.relay_path.len(), 15);

    let stats = n16.stats().relay;
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.ttl_exhausted, 1);
    assert_eq!(stats.forwarded, 0);

    // N15 sent the final hop; N17 never hears the packet
    assert_eq!(chain.node(15).stats().relay.forwarded, 1);
    assert!(!accepted(chain.node(17), &ack.content_hash));
    assert_eq!(chain.node(17).stats().relay.received, 0);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_low_urgency_reach_is_five_hops() {
    init_tracing();
    let chain = MeshChain::new(8).await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("need water", Urgency::Low))
        .unwrap();

    assert!(wait_until(SETTLE_TIMEOUT, || accepted(chain.node(6), &ack.content_hash)).await);
    settle().await;

    assert_eq!(chain.node(6).stats().relay.ttl_exhausted, 1);
    assert!(!accepted(chain.node(7), &ack.content_hash));

    chain.shutdown().await;
}

#[tokio::test]
async fn test_same_content_on_two_transports_relayed_once() {
    init_tracing();
    let radio = MemoryMedium::new();
    let lan = MemoryMedium::new();

    let origin = MeshNode::new(node_config("A"), None).unwrap();
    let relay = MeshNode::new(node_config("B"), None).unwrap();
    let listener = MeshNode::new(node_config("C"), None).unwrap();

    origin
        .attach_transport(Arc::new(MemoryTransport::with_kind("A:radio", &radio, TransportKind::ShortRangeRadio)))
        .await
        .unwrap();
    origin
        .attach_transport(Arc::new(MemoryTransport::with_kind("A:lan", &lan, TransportKind::LocalBroadcast)))
        .await
        .unwrap();
    relay
        .attach_transport(Arc::new(MemoryTransport::with_kind("B:radio", &radio, TransportKind::ShortRangeRadio)))
        .await
        .unwrap();
    relay
        .attach_transport(Arc::new(MemoryTransport::with_kind("B:lan", &lan, TransportKind::LocalBroadcast)))
        .await
        .unwrap();
    // C only hears the radio side, through B's relay and A's original
    let c_radio = Arc::new(MemoryTransport::new("C:radio", &radio));
    listener.attach_transport(c_radio.clone()).await.unwrap();

    let ack = origin
        .originate(SosRequest::new("gas leak", Urgency::Critical))
        .unwrap();
    assert_eq!(ack.targets.len(), 2);

    assert!(wait_until(SETTLE_TIMEOUT, || relay.stats().relay.received >= 2).await);
    settle().await;

    let b = relay.stats().relay;
    assert_eq!(b.accepted, 1);
    assert_eq!(b.forwarded, 1);
    assert!(b.duplicates >= 1);

    let entry = relay.engine().dedup().get(&ack.content_hash).unwrap().unwrap();
    assert_eq!(entry.best_known.hop_count, 0);
    assert!(entry.occurrence_count >= 2);

    // C's only transport is the one it heard the packet on
    assert_eq!(listener.stats().relay.accepted, 1);
    assert_eq!(c_radio.sent_count(), 0);

    for node in [&origin, &relay, &listener] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_thread_updates_reach_remote_node() {
    init_tracing();
    let chain = MeshChain::new(3).await;
    let origin = chain.node(0);

    let first = origin
        .originate(SosRequest::new("leg injury", Urgency::Medium))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let update = SosRequest::update(first.thread_id.clone(), "bleeding worse", Urgency::Critical)
        .with_location(Location::new(40.71, -74.0).unwrap().with_accuracy(8.0));
    let second = origin.originate(update).unwrap();
    assert_eq!(second.thread_id, first.thread_id);
    assert_ne!(second.content_hash, first.content_hash);

    let remote = chain.node(2);
    assert!(
        wait_until(SETTLE_TIMEOUT, || {
            remote
                .thread("N0", &first.thread_id)
                .is_some_and(|t| t.history().len() == 2)
        })
        .await
    );

    let thread = remote.thread("N0", &first.thread_id).unwrap();
    assert_eq!(thread.peak_urgency(), Some(Urgency::Critical));
    assert_eq!(thread.current().unwrap().message, "bleeding worse");
    assert_eq!(thread.current_location().unwrap().latitude, 40.71);

    let summaries = remote.threads();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].packets, 2);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_chain_nodes_report_direct_neighbors() {
    init_tracing();
    let chain = MeshChain::new(3).await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("smoke in stairwell", Urgency::High))
        .unwrap();
    let last = chain.node(2);
    assert!(wait_until(SETTLE_TIMEOUT, || accepted(last, &ack.content_hash)).await);

    // N2 hears the packet from N1, never from the originator
    let stats = serde_json::to_value(last.stats()).unwrap();
    let neighbors = stats["neighbors"].as_array().unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0]["node_id"], "N1");
    assert_eq!(neighbors[0]["transports"], serde_json::json!(["N2:link2"]));
    assert_eq!(neighbors[0]["reliability"], 1.0);

    let middle = chain.node(1).stats();
    assert_eq!(middle.neighbors.len(), 1);
    assert_eq!(middle.neighbors[0].node_id, "N0");
    assert_eq!(middle.relay.neighbors, 1);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_failing_transport_does_not_block_others() {
    init_tracing();
    let dead_medium = MemoryMedium::new();
    let live_medium = MemoryMedium::new();

    let origin = MeshNode::new(node_config("A"), None).unwrap();
    let peer = MeshNode::new(node_config("B"), None).unwrap();

    let dead = Arc::new(MemoryTransport::new("A:dead", &dead_medium));
    dead.set_failing(true);
    origin.attach_transport(dead).await.unwrap();
    origin
        .attach_transport(Arc::new(MemoryTransport::new("A:live", &live_medium)))
        .await
        .unwrap();
    peer.attach_transport(Arc::new(MemoryTransport::new("B:live", &live_medium)))
        .await
        .unwrap();

    let ack = origin
        .originate(SosRequest::new("fire", Urgency::High))
        .unwrap();
    assert!(wait_until(SETTLE_TIMEOUT, || peer.engine().dedup().contains(&ack.content_hash).unwrap_or(false)).await);

    let dead_failures = || {
        origin
            .stats()
            .transports
            .iter()
            .find(|t| t.transport_id == "A:dead")
            .map_or(0, |t| t.failed)
    };
    assert!(wait_until(SETTLE_TIMEOUT, || dead_failures() == 1).await);

    origin.shutdown().await.unwrap();
    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    init_tracing();
    let chain = MeshChain::new(2).await;

    let packet = SosPacket::originate("N9", SosRequest::new("ok", Urgency::High), 1_700_000_000_000).unwrap();
    let mut wire = packet.to_wire().unwrap();
    wire.truncate(wire.len() / 2);

    let engine = chain.node(1).engine();
    assert!(engine.handle_inbound(&wire, "N1:link1", 1_700_000_000_000).is_err());
    assert_eq!(engine.stats().malformed, 1);
    assert_eq!(engine.stats().forwarded, 0);

    chain.shutdown().await;
}
