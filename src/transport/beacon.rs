//! Periodic UDP discovery shared by the broadcast and direct transports.

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::TransportContext;
use crate::peer::{TransportInfo, TransportKind};
use crate::protocol::{Message, MessageKind};

const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Local address the discovery socket listens on.
    pub bind: SocketAddr,
    /// Where announcements are sent, normally the subnet broadcast address.
    pub target: SocketAddr,
    pub interval: Duration,
    /// Fraction of `interval` the period is randomly stretched or shrunk by.
    pub jitter: f64,
}

/// A UDP socket that can share its port and send to broadcast addresses.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub(crate) fn jittered(interval: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return interval;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    interval.mul_f64(factor).max(Duration::from_millis(1))
}

pub(crate) struct Beacon {
    pub ctx: TransportContext,
    pub kind: TransportKind,
    pub socket: Arc<UdpSocket>,
    pub config: BeaconConfig,
    /// Port peers should use to reach us, carried in announcements.
    pub advertised_port: Option<u16>,
    /// Register peers at the datagram's source port when they advertise none.
    pub source_port_fallback: bool,
}

impl Beacon {
    /// Announce on a jittered period and answer discovery until cancelled.
    /// Anything that is not discovery traffic goes to `on_other`.
    pub async fn run<F>(self, cancel: CancellationToken, mut on_other: F)
    where
        F: FnMut(Message, SocketAddr) + Send,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut next_announce = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_announce) => {
                    self.announce().await;
                    next_announce = Instant::now() + jittered(self.config.interval, self.config.jitter);
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        if let Some(msg) = self.handle(&buf[..n], from).await {
                            on_other(msg, from);
                        }
                    }
                    Err(e) => tracing::debug!("{} beacon recv error: {}", self.kind, e),
                }
            }
        }
        tracing::debug!("{} beacon stopped", self.kind);
    }

    async fn announce(&self) {
        let msg = Message::discovery(&self.ctx.local_id, self.kind, self.advertised_port);
        let data = self.ctx.format.encode(&msg);
        if let Err(e) = self.socket.send_to(&data, self.config.target).await {
            tracing::warn!(
                "{} discovery to {} failed: {}",
                self.kind,
                self.config.target,
                e
            );
        }
    }

    async fn handle(&self, datagram: &[u8], from: SocketAddr) -> Option<Message> {
        let msg = match self.ctx.format.decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("{} datagram from {} dropped: {}", self.kind, from, e);
                return None;
            }
        };
        if self.ctx.is_self(&msg.sender_id) {
            return None;
        }

        match msg.kind {
            MessageKind::Discovery => {
                if !self.register(&msg, from) {
                    return None;
                }
                let reply =
                    Message::discovery_response(&self.ctx.local_id, self.kind, self.advertised_port);
                let data = self.ctx.format.encode(&reply);
                if let Err(e) = self.socket.send_to(&data, from).await {
                    tracing::warn!("{} discovery response to {} failed: {}", self.kind, from, e);
                }
                None
            }
            MessageKind::DiscoveryResponse => {
                self.register(&msg, from);
                None
            }
            _ => Some(msg),
        }
    }

    /// False when the frame gives no usable port.
    fn register(&self, msg: &Message, from: SocketAddr) -> bool {
        let port = match msg.port {
            Some(port) => port,
            None if self.source_port_fallback => from.port(),
            None => {
                tracing::debug!(
                    "{} discovery from {} carries no port, ignoring",
                    self.kind,
                    msg.sender_id
                );
                return false;
            }
        };
        tracing::debug!("{} discovered {} at {}:{}", self.kind, msg.sender_id, from.ip(), port);
        self.ctx
            .discovered(&msg.sender_id, self.kind, TransportInfo::at(from.ip(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::registry::PeerRegistry;
    use crate::wire::WireFormatKind;
    use tokio::sync::mpsc;

    #[test]
    fn jitter_stays_in_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(base, 0.2);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[tokio::test]
    async fn bound_socket_reports_port() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn portless_discovery_is_not_answered_without_fallback() {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = TransportContext::new(
            PeerId::from("peer-self"),
            registry.clone(),
            WireFormatKind::Json.build(),
            tx,
        );
        let socket = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).unwrap());
        let local = socket.local_addr().unwrap();
        let beacon = Beacon {
            ctx: ctx.clone(),
            kind: TransportKind::Direct,
            socket,
            config: BeaconConfig {
                bind: local,
                target: local,
                interval: Duration::from_secs(60),
                jitter: 0.0,
            },
            advertised_port: Some(4000),
            source_port_fallback: false,
        };

        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from = remote.local_addr().unwrap();
        let other = PeerId::from("peer-other");
        let mut buf = [0u8; 1024];

        let portless = ctx
            .format
            .encode(&Message::discovery(&other, TransportKind::Direct, None));
        assert!(beacon.handle(&portless, from).await.is_none());
        assert!(!registry.contains(&other));
        let silence = tokio::time::timeout(Duration::from_millis(200), remote.recv_from(&mut buf)).await;
        assert!(silence.is_err());

        let with_port = ctx
            .format
            .encode(&Message::discovery(&other, TransportKind::Direct, Some(4100)));
        assert!(beacon.handle(&with_port, from).await.is_none());
        assert!(registry.contains(&other));
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = ctx.format.decode(&buf[..n]).unwrap();
        assert_eq!(reply.kind, MessageKind::DiscoveryResponse);
        assert_eq!(reply.port, Some(4000));
    }
}
