use async_trait::async_trait;
use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::link::{LinkSet, LinkSettings};
use super::{Lifecycle, Scope, Transport, TransportContext, TransportStatus};
use crate::error::TransportError;
use crate::peer::{PeerId, TransportInfo, TransportKind};

pub const SERVICE_TYPE: &str = "_peerprobe._tcp.local.";

const KIND: TransportKind = TransportKind::Service;
const PROP_ID: &str = "id";
const PROP_NAME: &str = "name";
const PROP_VERSION: &str = "version";
const UNREGISTER_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub listen: SocketAddr,
    pub service_type: String,
    pub display_name: String,
    pub link: LinkSettings,
}

struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Zero-configuration service advertisement and browsing, with the same
/// framed TCP links as the direct transport once a peer is resolved.
pub struct ServiceTransport {
    ctx: TransportContext,
    settings: ServiceSettings,
    lifecycle: Lifecycle,
    links: Arc<LinkSet>,
    advert: Mutex<Option<Advertisement>>,
}

impl ServiceTransport {
    pub fn new(ctx: TransportContext, settings: ServiceSettings) -> Self {
        let links = Arc::new(LinkSet::new(KIND, ctx.clone(), settings.link));
        Self {
            ctx,
            settings,
            lifecycle: Lifecycle::new(KIND),
            links,
            advert: Mutex::new(None),
        }
    }

    /// Advertise ourselves and start browsing. The daemon is handed back
    /// only once both succeeded.
    fn advertise(
        &self,
        port: u16,
    ) -> Result<(Advertisement, mdns_sd::Receiver<ServiceEvent>), TransportError> {
        let daemon = ServiceDaemon::new().map_err(unavailable)?;
        match self.register(&daemon, port) {
            Ok((fullname, receiver)) => Ok((Advertisement { daemon, fullname }, receiver)),
            Err(e) => {
                let _ = daemon.shutdown();
                Err(e)
            }
        }
    }

    fn register(
        &self,
        daemon: &ServiceDaemon,
        port: u16,
    ) -> Result<(String, mdns_sd::Receiver<ServiceEvent>), TransportError> {
        let ip = local_ip().map_err(unavailable)?;
        let id = self.ctx.local_id.as_str();
        let host = format!("{}.local.", id);
        let properties = [
            (PROP_ID, id),
            (PROP_NAME, self.settings.display_name.as_str()),
            (PROP_VERSION, env!("CARGO_PKG_VERSION")),
        ];
        let info = ServiceInfo::new(
            &self.settings.service_type,
            id,
            &host,
            &ip.to_string(),
            port,
            &properties[..],
        )
        .map_err(unavailable)?;

        let fullname = info.get_fullname().to_string();
        daemon.register(info).map_err(unavailable)?;
        tracing::info!("Registered service {} on {}:{}", fullname, ip, port);

        let receiver = daemon
            .browse(&self.settings.service_type)
            .map_err(unavailable)?;
        Ok((fullname, receiver))
    }

    async fn withdraw(&self) {
        let advert = self.advert.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Advertisement { daemon, fullname }) = advert else {
            return;
        };
        tracing::info!("Unregistering service: {}", fullname);
        match daemon.unregister(&fullname) {
            // Give the daemon a moment to send the goodbye packet.
            Ok(status) => {
                let _ = tokio::time::timeout(UNREGISTER_WAIT, status.recv_async()).await;
            }
            Err(e) => tracing::error!("Failed to unregister service: {}", e),
        }
        let _ = daemon.stop_browse(&self.settings.service_type);
        if let Err(e) = daemon.shutdown() {
            tracing::debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

fn unavailable(e: impl std::fmt::Display) -> TransportError {
    TransportError::ServiceDiscovery(e.to_string())
}

async fn browse(
    ctx: TransportContext,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        handle_event(&ctx, event);
    }
    tracing::debug!("service browse loop stopped");
}

fn handle_event(ctx: &TransportContext, event: ServiceEvent) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let Some(id) = info.get_property_val_str(PROP_ID) else {
                tracing::debug!("resolved service on {} without an id", info.get_hostname());
                return;
            };
            let peer_id = PeerId::from(id);
            if ctx.is_self(&peer_id) {
                return;
            }
            let Some(ip) = info
                .get_addresses()
                .iter()
                .find_map(|a| a.to_string().parse::<IpAddr>().ok())
            else {
                tracing::debug!("resolved service on {} has no usable address", info.get_hostname());
                return;
            };

            let mut attrs = TransportInfo::at(ip, info.get_port())
                .with_property("hostname", info.get_hostname());
            for key in [PROP_NAME, PROP_VERSION] {
                if let Some(value) = info.get_property_val_str(key) {
                    attrs = attrs.with_property(key, value);
                }
            }
            tracing::debug!("Resolved service peer {} at {}:{}", peer_id, ip, info.get_port());
            ctx.discovered(&peer_id, KIND, attrs);
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            let Some(id) = fullname.split('.').next() else {
                return;
            };
            let peer_id = PeerId::from(id);
            if !ctx.is_self(&peer_id) {
                tracing::debug!("Service {} withdrawn", fullname);
                ctx.registry.mark_inactive(&peer_id, KIND);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl Transport for ServiceTransport {
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
        let listener = match TcpListener::bind(self.settings.listen).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = TransportError::Bind {
                    what: "service listener",
                    addr: self.settings.listen,
                    source,
                };
                self.lifecycle.fail(&err);
                return Err(err);
            }
        };
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.settings.listen.port());

        let (advert, receiver) = match self.advertise(port) {
            Ok(advertised) => advertised,
            Err(e) => {
                self.lifecycle.fail(&e);
                return Err(e);
            }
        };
        *self.advert.lock().unwrap_or_else(|e| e.into_inner()) = Some(advert);

        let scope = Scope::new();
        self.links.attach(scope.clone());
        scope.spawn(self.links.clone().serve(listener, scope.cancel.clone()));
        scope.spawn(browse(self.ctx.clone(), receiver, scope.cancel.clone()));
        if !self.lifecycle.running(scope) {
            self.stop().await;
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.lifecycle.stop(&self.ctx.registry).await {
            self.links.detach();
            self.withdraw().await;
        }
    }

    async fn send(&self, peer_id: &PeerId, content: &str) -> bool {
        match self.links.send(peer_id, content).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Service send to {} failed: {}", peer_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use crate::transport::TransportEvent;
    use crate::wire::WireFormatKind;
    use tokio::sync::mpsc;

    fn context() -> (
        TransportContext,
        Arc<PeerRegistry>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TransportContext::new(
            PeerId::from("peer-self"),
            registry.clone(),
            WireFormatKind::Json.build(),
            tx,
        );
        (ctx, registry, rx)
    }

    fn resolved(instance: &str, properties: &[(&str, &str)]) -> ServiceEvent {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            "laptop.local.",
            "192.168.1.20",
            5558,
            properties,
        )
        .unwrap();
        ServiceEvent::ServiceResolved(Box::new(info.as_resolved_service()))
    }

    #[test]
    fn resolved_service_becomes_a_peer() {
        let (ctx, registry, mut rx) = context();
        handle_event(
            &ctx,
            resolved(
                "peer-other",
                &[(PROP_ID, "peer-other"), (PROP_NAME, "Laptop"), (PROP_VERSION, "0.1.0")],
            ),
        );

        let other = PeerId::from("peer-other");
        let peer = registry.get(&other).unwrap();
        assert!(peer.is_active(Some(KIND)));
        let info = peer.info(KIND).unwrap();
        assert_eq!(info.address, Some("192.168.1.20".parse().unwrap()));
        assert_eq!(info.port, Some(5558));
        assert_eq!(info.properties.get("name").map(String::as_str), Some("Laptop"));
        assert_eq!(info.properties.get("version").map(String::as_str), Some("0.1.0"));
        assert_eq!(info.properties.get("hostname").map(String::as_str), Some("laptop.local."));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::PeerDiscovered {
                peer_id: other,
                transport: KIND
            }
        );
    }

    #[test]
    fn own_and_anonymous_records_are_ignored() {
        let (ctx, registry, mut rx) = context();
        handle_event(&ctx, resolved("peer-self", &[(PROP_ID, "peer-self")]));
        handle_event(&ctx, resolved("peer-anon", &[(PROP_NAME, "No Id")]));

        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn removal_marks_peer_inactive() {
        let (ctx, registry, _rx) = context();
        let other = PeerId::from("peer-other");
        registry.upsert(&other, KIND, TransportInfo::default());

        handle_event(
            &ctx,
            ServiceEvent::ServiceRemoved(
                SERVICE_TYPE.to_string(),
                format!("peer-other.{}", SERVICE_TYPE),
            ),
        );
        assert!(!registry.get(&other).unwrap().is_active(Some(KIND)));
    }
}
