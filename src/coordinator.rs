//! Owns the registry and the transports, and is the only surface a front
//! end talks to.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::error::TransportError;
use crate::identity::Identity;
use crate::peer::{Peer, PeerId, TransportKind};
use crate::registry::{PeerRegistry, RegistryEvent};
use crate::transport::{
    BroadcastTransport, DirectTransport, ServiceTransport, Transport, TransportContext,
    TransportEvent, TransportStatus,
};

const EVENT_CAPACITY: usize = 1024;

/// Everything a front end needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    NewPeer {
        peer_id: PeerId,
        transport: TransportKind,
    },
    PeerInactive {
        peer_id: PeerId,
        transport: TransportKind,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
    MessageReceived {
        peer_id: PeerId,
        content: String,
        transport: TransportKind,
    },
}

impl From<RegistryEvent> for CoreEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::NewPeer { peer_id, transport } => CoreEvent::NewPeer { peer_id, transport },
            RegistryEvent::PeerInactive { peer_id, transport } => {
                CoreEvent::PeerInactive { peer_id, transport }
            }
            RegistryEvent::PeerRemoved { peer_id } => CoreEvent::PeerRemoved { peer_id },
        }
    }
}

pub struct Coordinator {
    identity: Identity,
    config: Config,
    registry: Arc<PeerRegistry>,
    transports: BTreeMap<TransportKind, Arc<dyn Transport>>,
    priority: Vec<TransportKind>,
    events: broadcast::Sender<CoreEvent>,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Coordinator {
    pub fn new(config: Config, identity: Identity) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TransportContext::new(
            identity.id.clone(),
            registry.clone(),
            config.format.build(),
            tx,
        );

        let mut transports: BTreeMap<TransportKind, Arc<dyn Transport>> = BTreeMap::new();
        transports.insert(
            TransportKind::Broadcast,
            Arc::new(BroadcastTransport::new(ctx.clone(), config.broadcast_settings())),
        );
        transports.insert(
            TransportKind::Direct,
            Arc::new(DirectTransport::new(ctx.clone(), config.direct_settings())),
        );
        transports.insert(
            TransportKind::Service,
            Arc::new(ServiceTransport::new(
                ctx,
                config.service_settings(&identity.display_name),
            )),
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            priority: config.priority(),
            identity,
            config,
            registry,
            transports,
            events,
            transport_events: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Spawn the event pump and the stale-peer sweeper, then start the
    /// configured transports in priority order. Returns the ones running.
    pub async fn start(&self) -> Vec<TransportKind> {
        self.spawn_background();

        let mut running = Vec::new();
        for kind in self.config.transports.clone() {
            match self.start_transport(kind).await {
                Ok(()) => running.push(kind),
                Err(e) => tracing::warn!("{} unavailable, continuing without it: {}", kind, e),
            }
        }
        if running.is_empty() {
            tracing::error!("No transport could be started");
        } else {
            tracing::info!(
                "Peer {} ({}) up on {:?}",
                self.identity.id,
                self.identity.display_name,
                running
            );
        }
        running
    }

    fn spawn_background(&self) {
        let Some(mut transport_rx) = self
            .transport_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let mut registry_rx = self.registry.subscribe();

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = registry_rx.recv() => CoreEvent::from(event),
                    Some(event) = transport_rx.recv() => match event {
                        TransportEvent::MessageReceived { peer_id, content, transport } => {
                            CoreEvent::MessageReceived { peer_id, content, transport }
                        }
                        // New peers surface through the registry, once.
                        TransportEvent::PeerDiscovered { .. } => continue,
                    },
                    else => break,
                };
                let _ = events.send(event);
            }
        });

        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.peer_timeout();
        let period = self.config.sweep_interval();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_stale(timeout);
                        if !evicted.is_empty() {
                            tracing::debug!("Sweep evicted {} peer(s)", evicted.len());
                        }
                    }
                }
            }
        });
    }

    fn transport(&self, kind: TransportKind) -> Result<&Arc<dyn Transport>, TransportError> {
        self.transports
            .get(&kind)
            .ok_or(TransportError::NotConfigured(kind))
    }

    pub async fn start_transport(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.transport(kind)?.start().await
    }

    pub async fn stop_transport(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.transport(kind)?.stop().await;
        Ok(())
    }

    pub fn status(&self) -> Vec<TransportStatus> {
        self.transports.values().map(|t| t.status()).collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.all_peers()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.registry.get(peer_id)
    }

    /// Unicast `content`. Without a transport, try the peer's active
    /// transports in priority order until one delivers.
    pub async fn send(&self, peer_id: &PeerId, content: &str, via: Option<TransportKind>) -> bool {
        if let Some(kind) = via {
            return match self.transport(kind) {
                Ok(transport) => transport.send(peer_id, content).await,
                Err(e) => {
                    tracing::warn!("Send to {} failed: {}", peer_id, e);
                    false
                }
            };
        }

        let Some(peer) = self.registry.get(peer_id) else {
            tracing::warn!("Send failed: unknown peer {}", peer_id);
            return false;
        };
        for kind in self.priority.iter().filter(|k| peer.is_active(Some(**k))) {
            if let Some(transport) = self.transports.get(kind) {
                if transport.send(peer_id, content).await {
                    return true;
                }
                tracing::debug!("{} could not reach {}, trying next transport", kind, peer_id);
            }
        }
        tracing::warn!("Send failed: no transport reached {}", peer_id);
        false
    }

    /// Send `content` to every active peer. With a transport, that
    /// transport's own broadcast; without, once per peer via [`send`].
    ///
    /// [`send`]: Coordinator::send
    pub async fn broadcast(&self, content: &str, via: Option<TransportKind>) -> bool {
        if let Some(kind) = via {
            return match self.transport(kind) {
                Ok(transport) => transport.broadcast(content).await,
                Err(e) => {
                    tracing::warn!("Broadcast failed: {}", e);
                    false
                }
            };
        }

        let mut all_sent = true;
        for peer in self.registry.active_peers(None) {
            if !self.send(&peer.id, content, None).await {
                all_sent = false;
            }
        }
        all_sent
    }

    /// Stop every transport and background task.
    pub async fn shutdown(&self) {
        for transport in self.transports.values() {
            transport.stop().await;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Coordinator for {} shut down", self.identity.id);
    }
}
