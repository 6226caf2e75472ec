mod common;

use std::time::Duration;

use common::*;
use peerprobe_lib::transport::BroadcastTransport;
use peerprobe_lib::wire::MAX_FRAME_LEN;
use peerprobe_lib::{Transport, TransportEvent, TransportKind, TransportState, WireFormatKind};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn peers_discover_each_other_and_exchange_datagrams() {
    let (px, py) = (free_udp_port(), free_udp_port());
    let x = node("peer-x", WireFormatKind::Json);
    let mut y = node("peer-y", WireFormatKind::Json);

    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(px, py));
    let ty = BroadcastTransport::new(y.ctx.clone(), beacon(py, px));
    tx.start().await.unwrap();
    ty.start().await.unwrap();

    assert!(
        eventually(WAIT, || {
            x.registry
                .get(&y.id)
                .is_some_and(|p| p.is_active(Some(TransportKind::Broadcast)))
                && y.registry
                    .get(&x.id)
                    .is_some_and(|p| p.is_active(Some(TransportKind::Broadcast)))
        })
        .await
    );
    let info = y.registry.get(&x.id).unwrap();
    let info = info.info(TransportKind::Broadcast).unwrap();
    assert_eq!(info.port, Some(px));

    assert!(tx.send(&y.id, "over udp").await);
    let (from, content, transport) = next_message(&mut y.events, WAIT).await.unwrap();
    assert_eq!(from, x.id);
    assert_eq!(content, "over udp");
    assert_eq!(transport, TransportKind::Broadcast);

    tx.stop().await;
    ty.stop().await;
}

#[tokio::test]
async fn oversized_datagram_is_refused() {
    let (px, py) = (free_udp_port(), free_udp_port());
    let x = node("peer-x", WireFormatKind::Topic);
    let mut y = node("peer-y", WireFormatKind::Topic);

    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(px, py));
    let ty = BroadcastTransport::new(y.ctx.clone(), beacon(py, px));
    tx.start().await.unwrap();
    ty.start().await.unwrap();
    assert!(
        eventually(WAIT, || x
            .registry
            .get(&y.id)
            .is_some_and(|p| p.is_active(Some(TransportKind::Broadcast))))
        .await
    );

    assert!(!tx.send(&y.id, &"a".repeat(MAX_FRAME_LEN * 2)).await);
    let peer = x.registry.get(&y.id).unwrap();
    assert!(peer.is_active(Some(TransportKind::Broadcast)));
    assert!(peer.history.is_empty());

    assert!(tx.send(&y.id, "small").await);
    let (_, content, _) = next_message(&mut y.events, WAIT).await.unwrap();
    assert_eq!(content, "small");

    tx.stop().await;
    ty.stop().await;
}

#[tokio::test]
async fn own_announcements_are_ignored() {
    let port = free_udp_port();
    let mut x = node("peer-x", WireFormatKind::Delimited);
    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(port, port));
    tx.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(x.registry.is_empty());
    assert!(x.events.try_recv().is_err());

    tx.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let x = node("peer-x", WireFormatKind::Binary);
    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(0, free_udp_port()));

    tx.stop().await;
    assert_eq!(tx.state(), TransportState::Stopped);

    tx.start().await.unwrap();
    let addr = tx.local_addr().unwrap();
    tx.start().await.unwrap();
    assert_eq!(tx.state(), TransportState::Running);
    assert_eq!(tx.local_addr(), Some(addr));

    tx.stop().await;
    tx.stop().await;
    assert_eq!(tx.state(), TransportState::Stopped);
    assert!(tx.local_addr().is_none());

    // Restartable after a stop.
    tx.start().await.unwrap();
    assert_eq!(tx.state(), TransportState::Running);
    tx.stop().await;
}

#[tokio::test]
async fn send_to_unknown_peer_fails() {
    let x = node("peer-x", WireFormatKind::Topic);
    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(0, free_udp_port()));
    tx.start().await.unwrap();

    assert!(!tx.send(&"peer-nobody".into(), "hello?").await);
    assert!(tx.broadcast("nobody home").await);

    tx.stop().await;
}

#[tokio::test]
async fn discovery_reaches_the_event_stream() {
    let (px, py) = (free_udp_port(), free_udp_port());
    let x = node("peer-x", WireFormatKind::Topic);
    let mut y = node("peer-y", WireFormatKind::Topic);

    let tx = BroadcastTransport::new(x.ctx.clone(), beacon(px, py));
    let ty = BroadcastTransport::new(y.ctx.clone(), beacon(py, px));
    ty.start().await.unwrap();
    tx.start().await.unwrap();

    let event = tokio::time::timeout(WAIT, y.events.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(TransportEvent::PeerDiscovered {
            peer_id: x.id.clone(),
            transport: TransportKind::Broadcast,
        })
    );

    tx.stop().await;
    ty.stop().await;
    assert!(!y
        .registry
        .get(&x.id)
        .unwrap()
        .is_active(Some(TransportKind::Broadcast)));
}
