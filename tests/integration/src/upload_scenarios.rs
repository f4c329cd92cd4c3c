//! Backend upload and receipt announcements across a mesh

use crate::test_utils::{init_tracing, settle, wait_until, MeshChain, RecordingBackend, SETTLE_TIMEOUT};
use sonicwave_mesh::{Backend, PacketType, SosRequest, Urgency};
use std::sync::Arc;

#[tokio::test]
async fn test_gateway_uploads_packet_from_offline_sender() {
    init_tracing();
    let gateway = RecordingBackend::new();
    let backend = Arc::clone(&gateway);
    let chain = MeshChain::with_backends(3, move |i| {
        (i == 2).then(|| Arc::clone(&backend) as Arc<dyn Backend>)
    })
    .await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("stranded on roof", Urgency::Critical))
        .unwrap();

    assert!(wait_until(SETTLE_TIMEOUT, || gateway.delivered_count() >= 1).await);
    let delivered = gateway.delivered();
    assert_eq!(delivered[0].content_hash, ack.content_hash);
    assert_eq!(delivered[0].sender_id, "N0");
    // The gateway uploads the copy it received, before its own relay hop
    assert_eq!(delivered[0].hop_count, 1);
    assert_eq!(delivered[0].relay_path, vec!["N1"]);

    let gateway_node = chain.node(2);
    assert!(
        wait_until(SETTLE_TIMEOUT, || {
            gateway_node
                .engine()
                .dedup()
                .get(&ack.content_hash)
                .ok()
                .flatten()
                .is_some_and(|e| e.acknowledged && !e.upload_pending)
        })
        .await
    );

    chain.shutdown().await;
}

#[tokio::test]
async fn test_receipt_ack_floods_back_to_sender() {
    init_tracing();
    let gateway = RecordingBackend::new();
    let backend = Arc::clone(&gateway);
    let chain = MeshChain::with_backends(3, move |i| {
        (i == 2).then(|| Arc::clone(&backend) as Arc<dyn Backend>)
    })
    .await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("child missing", Urgency::Critical))
        .unwrap();

    // The gateway's ACK reaches the sender, which marks its packet delivered
    let origin = chain.node(0);
    assert!(wait_until(SETTLE_TIMEOUT, || origin.stats().relay.acks_applied == 1).await);
    let entry = origin.engine().dedup().get(&ack.content_hash).unwrap().unwrap();
    assert!(entry.acknowledged);

    // The ACK joins the original thread, and only the SOS was uploaded
    let thread = origin.thread("N2", &ack.thread_id).unwrap();
    assert_eq!(thread.current().unwrap().packet_type, PacketType::Ack);
    assert_eq!(thread.current().unwrap().acknowledges, Some(ack.content_hash));
    settle().await;
    assert_eq!(gateway.delivered_count(), 1);
    assert_eq!(chain.node(2).stats().relay.originated, 1);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_peer_ack_cancels_pending_upload() {
    init_tracing();
    let offline = RecordingBackend::unreachable();
    let gateway = RecordingBackend::new();
    let (a, c) = (Arc::clone(&offline), Arc::clone(&gateway));
    let chain = MeshChain::with_backends(3, move |i| match i {
        0 => Some(Arc::clone(&a) as Arc<dyn Backend>),
        2 => Some(Arc::clone(&c) as Arc<dyn Backend>),
        _ => None,
    })
    .await;

    let ack = chain
        .node(0)
        .originate(SosRequest::new("collapsed building", Urgency::Critical))
        .unwrap();

    let origin = chain.node(0);
    assert!(
        wait_until(SETTLE_TIMEOUT, || {
            origin.stats().upload.is_some_and(|u| u.cancelled == 1)
        })
        .await
    );
    assert_eq!(gateway.delivered_count(), 1);
    assert_eq!(offline.delivered_count(), 0);

    let entry = origin.engine().dedup().get(&ack.content_hash).unwrap().unwrap();
    assert!(entry.acknowledged);
    assert!(!entry.upload_pending);

    chain.shutdown().await;
}

#[tokio::test]
async fn test_sender_acknowledged_before_any_delivery() {
    init_tracing();
    let offline = RecordingBackend::unreachable();
    let backend = Arc::clone(&offline);
    let chain = MeshChain::with_backends(1, move |_| Some(backend.clone() as Arc<dyn Backend>)).await;

    // No transports, no reachable backend: origination still succeeds
    let ack = chain
        .node(0)
        .originate(SosRequest::new("alone and lost", Urgency::High))
        .unwrap();
    assert!(ack.targets.is_empty());
    assert_eq!(ack.ttl_remaining, 15);

    assert!(wait_until(SETTLE_TIMEOUT, || {
        chain.node(0).stats().upload.is_some_and(|u| u.submitted == 1)
    })
    .await);

    chain.shutdown().await;
}
