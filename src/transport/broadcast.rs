use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::beacon::{bind_udp, Beacon, BeaconConfig};
use super::{Lifecycle, Scope, Transport, TransportContext, TransportStatus};
use crate::error::{SendError, TransportError};
use crate::peer::{PeerId, TransportInfo, TransportKind};
use crate::protocol::{Message, MessageKind};

const KIND: TransportKind = TransportKind::Broadcast;

/// Connectionless datagrams: discovery goes to the broadcast address,
/// messages go unicast to the address a peer was discovered at.
pub struct BroadcastTransport {
    ctx: TransportContext,
    config: BeaconConfig,
    lifecycle: Lifecycle,
    socket: Mutex<Option<Arc<tokio::net::UdpSocket>>>,
}

impl BroadcastTransport {
    pub fn new(ctx: TransportContext, config: BeaconConfig) -> Self {
        Self {
            ctx,
            config,
            lifecycle: Lifecycle::new(KIND),
            socket: Mutex::new(None),
        }
    }

    fn socket(&self) -> Option<Arc<tokio::net::UdpSocket>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Where the datagram socket is bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    async fn try_send(&self, peer_id: &PeerId, content: &str) -> Result<(), SendError> {
        let socket = self.socket().ok_or(SendError::NotRunning)?;
        let peer = self
            .ctx
            .registry
            .get(peer_id)
            .ok_or_else(|| SendError::UnknownPeer(peer_id.clone()))?;
        if !peer.is_active(Some(KIND)) {
            return Err(SendError::NotActive {
                peer: peer_id.clone(),
                transport: KIND,
            });
        }
        let addr = peer
            .info(KIND)
            .and_then(|info| Some(SocketAddr::new(info.address?, info.port?)))
            .ok_or_else(|| SendError::NoAddress(peer_id.clone()))?;

        let data = self
            .ctx
            .encode_outbound(&Message::message(&self.ctx.local_id, KIND, content))?;
        socket.send_to(&data, addr).await?;
        self.ctx.sent(peer_id, KIND, content);
        Ok(())
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    fn context(&self) -> &TransportContext {
        &self.ctx
    }

    fn status(&self) -> TransportStatus {
        self.lifecycle.status()
    }

    async fn start(&self) -> Result<(), TransportError> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let socket = match bind_udp(self.config.bind) {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                let err = TransportError::Bind {
                    what: "broadcast socket",
                    addr: self.config.bind,
                    source,
                };
                self.lifecycle.fail(&err);
                return Err(err);
            }
        };
        let local = socket.local_addr().unwrap_or(self.config.bind);
        tracing::info!("Broadcast transport listening on {}", local);

        let beacon = Beacon {
            ctx: self.ctx.clone(),
            kind: KIND,
            socket: socket.clone(),
            config: self.config.clone(),
            advertised_port: Some(local.port()),
            source_port_fallback: true,
        };
        let ctx = self.ctx.clone();
        let scope = Scope::new();
        scope.spawn(beacon.run(scope.cancel.clone(), move |msg, from| match msg.kind {
            MessageKind::Message => {
                if !ctx.registry.contains(&msg.sender_id) {
                    let port = msg.port.unwrap_or(from.port());
                    ctx.discovered(&msg.sender_id, KIND, TransportInfo::at(from.ip(), port));
                }
                match msg.content() {
                    Some(content) => ctx.received(&msg.sender_id, KIND, content),
                    None => tracing::debug!("empty message from {} ({})", msg.sender_id, from),
                }
            }
            other => tracing::trace!("ignoring {} datagram from {}", other, from),
        }));

        *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = Some(socket);
        if !self.lifecycle.running(scope) {
            self.stop().await;
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.lifecycle.stop(&self.ctx.registry).await {
            self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }

    async fn send(&self, peer_id: &PeerId, content: &str) -> bool {
        match self.try_send(peer_id, content).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Broadcast send to {} failed: {}", peer_id, e);
                false
            }
        }
    }
}
