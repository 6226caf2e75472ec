use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use super::beacon::{bind_udp, Beacon, BeaconConfig};
use super::link::{LinkSet, LinkSettings};
use super::{Lifecycle, Scope, Transport, TransportContext, TransportStatus};
use crate::error::TransportError;
use crate::peer::{PeerId, TransportKind};

const KIND: TransportKind = TransportKind::Direct;

#[derive(Debug, Clone)]
pub struct DirectSettings {
    /// Where the data listener binds.
    pub listen: SocketAddr,
    /// The companion discovery beacon, which advertises the data port.
    pub beacon: BeaconConfig,
    pub link: LinkSettings,
}

/// Persistent TCP links, found through a UDP beacon on a separate port.
pub struct DirectTransport {
    ctx: TransportContext,
    settings: DirectSettings,
    lifecycle: Lifecycle,
    links: Arc<LinkSet>,
    bound: Mutex<Option<SocketAddr>>,
}

impl DirectTransport {
    pub fn new(ctx: TransportContext, settings: DirectSettings) -> Self {
        let links = Arc::new(LinkSet::new(KIND, ctx.clone(), settings.link));
        Self {
            ctx,
            settings,
            lifecycle: Lifecycle::new(KIND),
            links,
            bound: Mutex::new(None),
        }
    }

    /// The data listener's address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    async fn bind(&self) -> Result<(TcpListener, tokio::net::UdpSocket), TransportError> {
        let listener = TcpListener::bind(self.settings.listen)
            .await
            .map_err(|source| TransportError::Bind {
                what: "direct listener",
                addr: self.settings.listen,
                source,
            })?;
        let beacon = bind_udp(self.settings.beacon.bind).map_err(|source| TransportError::Bind {
            what: "direct discovery socket",
            addr: self.settings.beacon.bind,
            source,
        })?;
        Ok((listener, beacon))
    }
}

#[async_trait]
impl Transport for DirectTransport {
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
        let (listener, socket) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.lifecycle.fail(&e);
                return Err(e);
            }
        };
        let local = listener.local_addr().unwrap_or(self.settings.listen);
        tracing::info!("Direct transport listening on {}", local);

        let scope = Scope::new();
        self.links.attach(scope.clone());
        scope.spawn(self.links.clone().serve(listener, scope.cancel.clone()));

        let beacon = Beacon {
            ctx: self.ctx.clone(),
            kind: KIND,
            socket: Arc::new(socket),
            config: self.settings.beacon.clone(),
            advertised_port: Some(local.port()),
            source_port_fallback: false,
        };
        scope.spawn(beacon.run(scope.cancel.clone(), |msg, from| {
            tracing::debug!("direct discovery socket ignoring {} from {}", msg.kind, from)
        }));

        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        if !self.lifecycle.running(scope) {
            self.stop().await;
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.lifecycle.stop(&self.ctx.registry).await {
            self.links.detach();
            self.bound.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }

    async fn send(&self, peer_id: &PeerId, content: &str) -> bool {
        match self.links.send(peer_id, content).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Direct send to {} failed: {}", peer_id, e);
                false
            }
        }
    }
}
