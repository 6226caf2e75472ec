//! Persistent framed TCP links, one per peer, shared by the direct and
//! service transports.
//!
//! Links live in an arena keyed by peer id. Each link is driven by its own
//! task which owns the socket; senders talk to it over a channel and wait
//! for the write to be acknowledged.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::{Scope, TransportContext};
use crate::error::SendError;
use crate::peer::{ConnectionId, PeerId, TransportInfo, TransportKind};
use crate::protocol::{Message, MessageKind};
use crate::wire::FrameCodec;

const OUTBOUND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    /// Idle time after which a keepalive is sent.
    pub read_timeout: Duration,
    /// Consecutive unanswered keepalives before the link is dropped.
    pub max_missed_keepalives: u32,
    pub connect_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            max_missed_keepalives: 3,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Outbound {
    message: Message,
    done: oneshot::Sender<io::Result<()>>,
}

#[derive(Clone)]
struct Link {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
}

impl Link {
    async fn deliver(&self, peer_id: &PeerId, message: Message) -> Result<(), SendError> {
        let (done, ack) = oneshot::channel();
        self.outbound
            .send(Outbound { message, done })
            .await
            .map_err(|_| SendError::LinkClosed(peer_id.clone()))?;
        ack.await
            .map_err(|_| SendError::LinkClosed(peer_id.clone()))?
            .map_err(SendError::Io)
    }
}

pub(crate) struct LinkSet {
    kind: TransportKind,
    ctx: TransportContext,
    settings: LinkSettings,
    links: Mutex<HashMap<PeerId, Link>>,
    next_id: AtomicU64,
    scope: Mutex<Option<Scope>>,
}

impl LinkSet {
    pub fn new(kind: TransportKind, ctx: TransportContext, settings: LinkSettings) -> Self {
        Self {
            kind,
            ctx,
            settings,
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            scope: Mutex::new(None),
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeerId, Link>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scope(&self) -> Option<Scope> {
        self.scope.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn attach(&self, scope: Scope) {
        *self.scope.lock().unwrap_or_else(|e| e.into_inner()) = Some(scope);
    }

    pub fn detach(&self) {
        self.scope.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.links().clear();
    }

    pub fn len(&self) -> usize {
        self.links().len()
    }

    fn link_for(&self, peer_id: &PeerId) -> Option<Link> {
        self.links().get(peer_id).cloned()
    }

    /// Drop the arena entry for `peer_id` if it still points at link `id`.
    fn remove(&self, peer_id: &PeerId, id: ConnectionId) -> bool {
        let mut links = self.links();
        match links.get(peer_id) {
            Some(link) if link.id == id => {
                links.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Accept inbound links until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, remote)) => {
                        tracing::debug!("{} accepted connection from {}", self.kind, remote);
                        if let Err(e) = self.spawn_link(stream, remote, None) {
                            tracing::warn!("{} dropping connection from {}: {}", self.kind, remote, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("{} accept failed: {}", self.kind, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        tracing::debug!("{} listener closed", self.kind);
    }

    /// Register a link (when the peer is already known) and start its task.
    fn spawn_link(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        peer_id: Option<PeerId>,
    ) -> Result<Link, SendError> {
        let scope = self.scope().ok_or(SendError::NotRunning)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let link = Link { id, outbound: tx };

        if let Some(peer_id) = &peer_id {
            self.links().insert(peer_id.clone(), link.clone());
            self.ctx.registry.upsert(
                peer_id,
                self.kind,
                TransportInfo::default().with_connection(id),
            );
        }

        let links = self.clone();
        let task_link = link.clone();
        let cancel = scope.cancel.child_token();
        scope.spawn(async move {
            links.drive(stream, remote, peer_id, task_link, rx, cancel).await;
        });
        Ok(link)
    }

    async fn drive(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        mut peer_id: Option<PeerId>,
        link: Link,
        mut outbound: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
    ) {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, FrameCodec::new(self.ctx.format.clone()));
        let mut missed: u32 = 0;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "transport stopped".to_string(),
                Some(out) = outbound.recv() => {
                    let res = framed.send(out.message).await;
                    let failed = res.as_ref().err().map(|e| format!("write failed: {}", e));
                    let _ = out.done.send(res);
                    if let Some(reason) = failed {
                        break reason;
                    }
                }
                frame = tokio::time::timeout(self.settings.read_timeout, framed.next()) => match frame {
                    Err(_) => {
                        missed += 1;
                        if missed > self.settings.max_missed_keepalives {
                            break format!("{} keepalives unanswered", missed - 1);
                        }
                        tracing::trace!("{} link {} idle, sending keepalive", self.kind, remote);
                        let keepalive = Message::keepalive(&self.ctx.local_id, self.kind);
                        if let Err(e) = framed.send(keepalive).await {
                            break format!("keepalive failed: {}", e);
                        }
                    }
                    Ok(None) => break "closed by peer".to_string(),
                    Ok(Some(Err(e))) => break format!("read failed: {}", e),
                    Ok(Some(Ok(Err(e)))) => {
                        missed = 0;
                        tracing::warn!("{} frame from {} dropped: {}", self.kind, remote, e);
                    }
                    Ok(Some(Ok(Ok(msg)))) => {
                        missed = 0;
                        self.on_frame(msg, remote, &mut peer_id, &link);
                    }
                }
            }
        };

        match peer_id {
            Some(peer_id) => {
                tracing::info!("{} link to {} ({}) closed: {}", self.kind, peer_id, remote, reason);
                if self.remove(&peer_id, link.id) {
                    self.ctx
                        .registry
                        .clear_connection(&peer_id, self.kind, link.id);
                    self.ctx.registry.mark_inactive(&peer_id, self.kind);
                }
            }
            None => tracing::debug!("{} unidentified link {} closed: {}", self.kind, remote, reason),
        }
    }

    fn on_frame(&self, msg: Message, remote: SocketAddr, peer_id: &mut Option<PeerId>, link: &Link) {
        if self.ctx.is_self(&msg.sender_id) {
            tracing::debug!("{} ignoring our own frame on {}", self.kind, remote);
            return;
        }
        match peer_id.as_ref() {
            Some(known) if *known != msg.sender_id => {
                tracing::warn!(
                    "{} frame on link to {} claims sender {}, dropped",
                    self.kind,
                    known,
                    msg.sender_id
                );
                return;
            }
            Some(_) => {
                self.ctx.registry.upsert(
                    &msg.sender_id,
                    self.kind,
                    TransportInfo {
                        address: Some(remote.ip()),
                        ..Default::default()
                    },
                );
            }
            None => {
                // First frame names the peer on the other end.
                let sender = msg.sender_id.clone();
                let replaced = self.links().insert(sender.clone(), link.clone());
                if replaced.is_some() {
                    tracing::debug!("{} link to {} replaced by inbound {}", self.kind, sender, remote);
                }
                let mut info = TransportInfo::default().with_connection(link.id);
                info.address = Some(remote.ip());
                self.ctx.discovered(&sender, self.kind, info);
                *peer_id = Some(sender);
            }
        }

        match msg.kind {
            MessageKind::Message => match msg.content() {
                Some(content) => self.ctx.received(&msg.sender_id, self.kind, content),
                None => tracing::debug!("{} empty message from {}", self.kind, msg.sender_id),
            },
            MessageKind::Keepalive => {
                tracing::trace!("{} keepalive from {}", self.kind, msg.sender_id)
            }
            other => tracing::debug!("{} ignoring {} on link from {}", self.kind, other, remote),
        }
    }

    /// Send a message frame to `peer_id`, reusing its link or opening one.
    pub async fn send(self: &Arc<Self>, peer_id: &PeerId, content: &str) -> Result<(), SendError> {
        if self.scope().is_none() {
            return Err(SendError::NotRunning);
        }
        let peer = self
            .ctx
            .registry
            .get(peer_id)
            .ok_or_else(|| SendError::UnknownPeer(peer_id.clone()))?;
        if !peer.is_active(Some(self.kind)) {
            return Err(SendError::NotActive {
                peer: peer_id.clone(),
                transport: self.kind,
            });
        }
        let message = Message::message(&self.ctx.local_id, self.kind, content);
        // The link task encodes again; this only checks the frame fits.
        self.ctx.encode_outbound(&message)?;

        if let Some(link) = self.link_for(peer_id) {
            match link.deliver(peer_id, message.clone()).await {
                Ok(()) => {
                    self.ctx.sent(peer_id, self.kind, content);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("{} stale link to {}: {}, reconnecting", self.kind, peer_id, e);
                    self.remove(peer_id, link.id);
                }
            }
        }

        let addr = peer
            .info(self.kind)
            .and_then(|info| Some(SocketAddr::new(info.address?, info.port?)))
            .ok_or_else(|| SendError::NoAddress(peer_id.clone()))?;
        let stream = match self.connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.ctx.registry.mark_inactive(peer_id, self.kind);
                return Err(e);
            }
        };
        tracing::debug!("{} connected to {} at {}", self.kind, peer_id, addr);

        let link = self.spawn_link(stream, addr, Some(peer_id.clone()))?;
        link.deliver(peer_id, message).await?;
        self.ctx.sent(peer_id, self.kind, content);
        Ok(())
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, SendError> {
        tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SendError::Timeout(addr))?
            .map_err(|source| SendError::Connect { addr, source })
    }
}
