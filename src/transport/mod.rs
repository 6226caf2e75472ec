//! Transports: independent network mechanisms for reaching peers.
//!
//! Each transport owns its sockets and tasks, writes peer state only through
//! the [`PeerRegistry`] operations, and reports upward through
//! [`TransportEvent`]s.

mod beacon;
mod broadcast;
mod direct;
mod link;
mod service;

pub use beacon::BeaconConfig;
pub use broadcast::BroadcastTransport;
pub use direct::{DirectSettings, DirectTransport};
pub use link::LinkSettings;
pub use service::{ServiceSettings, ServiceTransport, SERVICE_TYPE};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{SendError, TransportError};
use crate::peer::{Direction, PeerId, TransportInfo, TransportKind};
use crate::protocol::Message;
use crate::registry::PeerRegistry;
use crate::wire::{WireFormat, MAX_FRAME_LEN};

/// How long `stop()` waits for a transport's tasks to wind down.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerDiscovered {
        peer_id: PeerId,
        transport: TransportKind,
    },
    MessageReceived {
        peer_id: PeerId,
        content: String,
        transport: TransportKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Stopped => "stopped",
            TransportState::Starting => "starting",
            TransportState::Running => "running",
            TransportState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub kind: TransportKind,
    pub state: TransportState,
    /// Why the last start attempt failed, if it did.
    pub last_error: Option<String>,
}

/// Everything a transport shares with the rest of the core.
#[derive(Clone)]
pub struct TransportContext {
    pub local_id: PeerId,
    pub registry: Arc<PeerRegistry>,
    pub format: Arc<dyn WireFormat>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportContext {
    pub fn new(
        local_id: PeerId,
        registry: Arc<PeerRegistry>,
        format: Arc<dyn WireFormat>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            local_id,
            registry,
            format,
            events,
        }
    }

    pub fn is_self(&self, peer_id: &PeerId) -> bool {
        *peer_id == self.local_id
    }

    /// Record a sighting of `peer_id`. Our own id is ignored.
    pub fn discovered(&self, peer_id: &PeerId, transport: TransportKind, info: TransportInfo) -> bool {
        if self.is_self(peer_id) {
            return false;
        }
        self.registry.upsert(peer_id, transport, info);
        let _ = self.events.send(TransportEvent::PeerDiscovered {
            peer_id: peer_id.clone(),
            transport,
        });
        true
    }

    pub fn received(&self, peer_id: &PeerId, transport: TransportKind, content: &str) {
        self.registry
            .record_message(peer_id, transport, content, Direction::Inbound);
        tracing::debug!("{} message from {}: {}", transport, peer_id, content);
        let _ = self.events.send(TransportEvent::MessageReceived {
            peer_id: peer_id.clone(),
            content: content.to_string(),
            transport,
        });
    }

    pub fn sent(&self, peer_id: &PeerId, transport: TransportKind, content: &str) {
        self.registry
            .record_message(peer_id, transport, content, Direction::Outbound);
    }

    /// Encode an outbound frame. Frames over [`MAX_FRAME_LEN`] are refused
    /// here, since every receiver rejects them.
    pub fn encode_outbound(&self, message: &Message) -> Result<Vec<u8>, SendError> {
        let data = self.format.encode(message);
        if data.len() > MAX_FRAME_LEN {
            return Err(SendError::TooLarge {
                size: data.len(),
                limit: MAX_FRAME_LEN,
            });
        }
        Ok(data)
    }
}

/// The contract every transport satisfies.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn context(&self) -> &TransportContext;

    fn status(&self) -> TransportStatus;

    fn state(&self) -> TransportState {
        self.status().state
    }

    /// Bind sockets and spawn the control loop. A no-op when already
    /// running or starting.
    async fn start(&self) -> Result<(), TransportError>;

    /// Cancel every task, close every socket and wait for the tasks to
    /// finish. Safe to call on a transport that never started.
    async fn stop(&self);

    /// Unicast `content` to `peer_id` on this transport only.
    async fn send(&self, peer_id: &PeerId, content: &str) -> bool;

    /// Best-effort send to every peer active on this transport. One
    /// failure does not stop the rest.
    async fn broadcast(&self, content: &str) -> bool {
        let mut all_sent = true;
        for peer in self.context().registry.active_peers(Some(self.kind())) {
            if !self.send(&peer.id, content).await {
                all_sent = false;
            }
        }
        all_sent
    }
}

/// Cancellation and task ownership for one run of a transport.
#[derive(Clone)]
pub(crate) struct Scope {
    pub cancel: CancellationToken,
    tracker: TaskTracker,
    handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(task);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
    }

    /// Cancel, wait up to [`STOP_GRACE`], then abort whatever is left.
    async fn shutdown(self, kind: TransportKind) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(STOP_GRACE, self.tracker.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(
            "{} transport: aborting {} task(s) still running after {:?}",
            kind,
            self.tracker.len(),
            STOP_GRACE
        );
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            handle.abort();
        }
        self.tracker.wait().await;
    }
}

struct LifecycleInner {
    state: TransportState,
    last_error: Option<String>,
    scope: Option<Scope>,
    /// A stop arrived while the transport was still starting.
    stop_pending: bool,
}

/// The `Stopped → Starting → Running → Stopping → Stopped` state machine
/// shared by all transports.
pub(crate) struct Lifecycle {
    kind: TransportKind,
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(LifecycleInner {
                state: TransportState::Stopped,
                last_error: None,
                scope: None,
                stop_pending: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> TransportStatus {
        let inner = self.lock();
        TransportStatus {
            kind: self.kind,
            state: inner.state,
            last_error: inner.last_error.clone(),
        }
    }

    /// Move to `Starting`. False when a start is pointless right now.
    pub fn begin_start(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != TransportState::Stopped {
            return false;
        }
        inner.state = TransportState::Starting;
        inner.last_error = None;
        inner.stop_pending = false;
        true
    }

    pub fn fail(&self, err: &TransportError) {
        tracing::warn!("{} transport failed to start: {}", self.kind, err);
        let mut inner = self.lock();
        inner.state = TransportState::Stopped;
        inner.last_error = Some(err.to_string());
        inner.scope = None;
        inner.stop_pending = false;
    }

    /// Move to `Running`. Returns false when a stop was requested during
    /// start-up; the caller must then stop straight away.
    #[must_use]
    pub fn running(&self, scope: Scope) -> bool {
        let mut inner = self.lock();
        inner.state = TransportState::Running;
        inner.scope = Some(scope);
        if std::mem::take(&mut inner.stop_pending) {
            tracing::info!("{} transport started with a stop pending", self.kind);
            return false;
        }
        tracing::info!("{} transport running", self.kind);
        true
    }

    /// Move to `Stopping` and hand back the run's scope, if it is running.
    /// A transport still starting is flagged so `running` reports the stop.
    fn begin_stop(&self) -> Option<Scope> {
        let mut inner = self.lock();
        match inner.state {
            TransportState::Running => {
                inner.state = TransportState::Stopping;
                inner.scope.take()
            }
            TransportState::Starting => {
                inner.stop_pending = true;
                None
            }
            TransportState::Stopping | TransportState::Stopped => None,
        }
    }

    fn stopped(&self) {
        self.lock().state = TransportState::Stopped;
        tracing::info!("{} transport stopped", self.kind);
    }

    /// Tear down a running transport: cancel and drain its tasks, then mark
    /// every peer inactive on it.
    pub async fn stop(&self, registry: &PeerRegistry) -> bool {
        let Some(scope) = self.begin_stop() else {
            return false;
        };
        scope.shutdown(self.kind).await;
        for peer in registry.active_peers(Some(self.kind)) {
            registry.mark_inactive(&peer.id, self.kind);
        }
        self.stopped();
        true
    }
}
