#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use peerprobe_lib::transport::{BeaconConfig, LinkSettings, TransportContext};
use peerprobe_lib::{PeerId, PeerRegistry, TransportEvent, WireFormatKind};
use tokio::sync::mpsc;

pub struct Node {
    pub id: PeerId,
    pub ctx: TransportContext,
    pub registry: Arc<PeerRegistry>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub fn node(id: &str, format: WireFormatKind) -> Node {
    let id = PeerId::from(id);
    let registry = Arc::new(PeerRegistry::new());
    let (tx, events) = mpsc::unbounded_channel();
    let ctx = TransportContext::new(id.clone(), registry.clone(), format.build(), tx);
    Node {
        id,
        ctx,
        registry,
        events,
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

/// A loopback UDP port nobody is using right now.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind(loopback(0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A loopback TCP port nobody is listening on.
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind(loopback(0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A fast, jitter-free beacon on `bind` announcing to `target`.
pub fn beacon(bind: u16, target: u16) -> BeaconConfig {
    BeaconConfig {
        bind: loopback(bind),
        target: loopback(target),
        interval: Duration::from_millis(100),
        jitter: 0.0,
    }
}

pub fn quick_links() -> LinkSettings {
    LinkSettings {
        read_timeout: Duration::from_millis(150),
        max_missed_keepalives: 2,
        connect_timeout: Duration::from_secs(1),
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Next `MessageReceived` event, skipping discovery noise.
pub async fn next_message(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    within: Duration,
) -> Option<(PeerId, String, peerprobe_lib::TransportKind)> {
    tokio::time::timeout(within, async {
        while let Some(event) = events.recv().await {
            if let TransportEvent::MessageReceived {
                peer_id,
                content,
                transport,
            } = event
            {
                return Some((peer_id, content, transport));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
