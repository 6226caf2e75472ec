use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::peer::{unix_now, PeerId, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Discovery,
    DiscoveryResponse,
    Message,
    Keepalive,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Discovery => "discovery",
            MessageKind::DiscoveryResponse => "discovery_response",
            MessageKind::Message => "message",
            MessageKind::Keepalive => "keepalive",
        }
    }

    pub fn is_discovery(&self) -> bool {
        matches!(self, MessageKind::Discovery | MessageKind::DiscoveryResponse)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(MessageKind::Discovery),
            "discovery_response" => Ok(MessageKind::DiscoveryResponse),
            "message" => Ok(MessageKind::Message),
            "keepalive" => Ok(MessageKind::Keepalive),
            other => Err(other.to_string()),
        }
    }
}

/// Format-independent message exchanged by every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "peer_id")]
    pub sender_id: PeerId,
    pub timestamp: u64,
    #[serde(rename = "protocol")]
    pub transport: TransportKind,
    /// Listen port advertised by discovery messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Only `message` carries content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Message {
    fn bare(kind: MessageKind, sender_id: &PeerId, transport: TransportKind) -> Self {
        Self {
            kind,
            sender_id: sender_id.clone(),
            timestamp: unix_now(),
            transport,
            port: None,
            content: None,
        }
    }

    pub fn discovery(sender_id: &PeerId, transport: TransportKind, port: Option<u16>) -> Self {
        Self {
            port,
            ..Self::bare(MessageKind::Discovery, sender_id, transport)
        }
    }

    pub fn discovery_response(sender_id: &PeerId, transport: TransportKind, port: Option<u16>) -> Self {
        Self {
            port,
            ..Self::bare(MessageKind::DiscoveryResponse, sender_id, transport)
        }
    }

    pub fn message(sender_id: &PeerId, transport: TransportKind, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::bare(MessageKind::Message, sender_id, transport)
        }
    }

    pub fn keepalive(sender_id: &PeerId, transport: TransportKind) -> Self {
        Self::bare(MessageKind::Keepalive, sender_id, transport)
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Drop content from any frame that is not a `message`.
    pub(crate) fn normalized(mut self) -> Self {
        if self.kind != MessageKind::Message {
            self.content = None;
        }
        self
    }
}
