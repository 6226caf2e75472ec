use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of messages kept per peer for diagnostics.
pub const HISTORY_CAPACITY: usize = 100;

/// Stable identifier of a participant, chosen once per process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `peer-` followed by eight hex digits of a fresh v4 uuid.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("peer-{}", &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The network mechanisms a peer can be reached over.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Broadcast,
    Direct,
    Service,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Broadcast,
        TransportKind::Direct,
        TransportKind::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Broadcast => "broadcast",
            TransportKind::Direct => "direct",
            TransportKind::Service => "service",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown transport: {}", s))
    }
}

/// Identifier of an open link, handed out by the transport that owns it.
pub type ConnectionId = u64;

/// Transport-specific connection data for one peer.
///
/// `None` fields in an update leave the stored value alone, so transports
/// can refresh part of an entry without clobbering the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub connection: Option<ConnectionId>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TransportInfo {
    pub fn at(address: IpAddr, port: u16) -> Self {
        Self {
            address: Some(address),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn merge(&mut self, update: TransportInfo) {
        if update.address.is_some() {
            self.address = update.address;
        }
        if update.port.is_some() {
            self.port = update.port;
        }
        if update.connection.is_some() {
            self.connection = update.connection;
        }
        self.properties.extend(update.properties);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub transport: TransportKind,
    pub payload: String,
}

/// A remote participant as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub transports: BTreeMap<TransportKind, TransportInfo>,
    pub active: BTreeSet<TransportKind>,
    pub history: VecDeque<MessageRecord>,
}

impl Peer {
    pub(crate) fn new(id: PeerId, transport: TransportKind, info: TransportInfo, now: SystemTime) -> Self {
        let mut transports = BTreeMap::new();
        transports.insert(transport, info);
        Self {
            id,
            first_seen: now,
            last_seen: now,
            transports,
            active: BTreeSet::from([transport]),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Active on `transport`, or on anything at all when `None`.
    pub fn is_active(&self, transport: Option<TransportKind>) -> bool {
        match transport {
            Some(t) => self.active.contains(&t),
            None => !self.active.is_empty(),
        }
    }

    pub fn info(&self, transport: TransportKind) -> Option<&TransportInfo> {
        self.transports.get(&transport)
    }

    pub(crate) fn push_history(&mut self, record: MessageRecord) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active: Vec<&str> = self.active.iter().map(|t| t.as_str()).collect();
        write!(f, "{} [{}]", self.id, active.join(", "))
    }
}

/// Seconds since the unix epoch, saturating at zero for clocks set before it.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn generated_ids_look_like_peer_ids() {
        let id = PeerId::generate();
        assert!(id.as_str().starts_with("peer-"));
        assert_eq!(id.as_str().len(), 13);
        assert_ne!(id, PeerId::generate());
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let mut info = TransportInfo::at(IpAddr::V4(Ipv4Addr::LOCALHOST), 6000)
            .with_property("name", "alpha");
        info.merge(TransportInfo::default().with_connection(7));

        assert_eq!(info.port, Some(6000));
        assert_eq!(info.connection, Some(7));
        assert_eq!(info.properties.get("name").map(String::as_str), Some("alpha"));
    }

    #[test]
    fn transport_kind_parses_its_own_names() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>(), Ok(kind));
        }
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
