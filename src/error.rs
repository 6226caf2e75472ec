use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::peer::{PeerId, TransportKind};

/// Errors that keep a transport from starting.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A socket or listener could not be bound.
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The local service-discovery backend is missing or refused us.
    #[error("service discovery unavailable: {0}")]
    ServiceDiscovery(String),
    /// The coordinator was asked for a transport it does not hold.
    #[error("transport {0} is not configured")]
    NotConfigured(TransportKind),
}

/// Why a unicast attempt failed. Transports log these and report `false`.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {peer} is not active on {transport}")]
    NotActive { peer: PeerId, transport: TransportKind },
    #[error("no address known for peer {0}")]
    NoAddress(PeerId),
    #[error("transport is not running")]
    NotRunning,
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {0}")]
    Timeout(SocketAddr),
    #[error("link to {0} closed")]
    LinkClosed(PeerId),
    #[error("{size}-byte frame exceeds the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The specific reason a wire frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("frame is truncated")]
    Truncated,
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("{0}")]
    Malformed(String),
}

/// A frame that could not be decoded. Carries the raw payload so the
/// receiving loop can log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{format} decode failed: {kind} ({} raw bytes)", .raw.len())]
pub struct DecodeError {
    pub format: &'static str,
    pub kind: DecodeErrorKind,
    pub raw: Vec<u8>,
}

impl DecodeError {
    pub fn new(format: &'static str, kind: DecodeErrorKind, raw: &[u8]) -> Self {
        Self {
            format,
            kind,
            raw: raw.to_vec(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
