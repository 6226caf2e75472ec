use super::{WireFormat, MAX_FRAME_LEN};
use crate::error::{DecodeError, DecodeErrorKind};
use crate::peer::PeerId;
use crate::protocol::{Message, MessageKind};

const NAME: &str = "binary";
const VERSION: u8 = 1;

const TYPE_MESSAGE: u8 = 0;
const TYPE_DISCOVERY: u8 = 1;
const TYPE_DISCOVERY_RESPONSE: u8 = 2;
const TYPE_KEEPALIVE: u8 = 3;

const FLAG_CONTENT: u8 = 0b01;
const FLAG_PORT: u8 = 0b10;

/// Compact proto-like framing, all integers big endian:
///
/// ```text
/// version:u8 type:u8 flags:u8
/// id_len:u32 id
/// timestamp:u64 port:u16
/// protocol_len:u32 protocol
/// content_len:u32 content
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

fn type_code(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::Message => TYPE_MESSAGE,
        MessageKind::Discovery => TYPE_DISCOVERY,
        MessageKind::DiscoveryResponse => TYPE_DISCOVERY_RESPONSE,
        MessageKind::Keepalive => TYPE_KEEPALIVE,
    }
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_be_bytes(raw)
        })
    }
}

/// Walk the header fields. `Ok(None)` means the buffer ends early.
fn scan(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    let too_large = |n: usize| DecodeError::new(NAME, DecodeErrorKind::TooLarge(n), buf);

    let mut cur = Cursor::new(buf);
    let Some(version) = cur.u8() else {
        return Ok(None);
    };
    if version != VERSION {
        return Err(DecodeError::new(NAME, DecodeErrorKind::BadVersion(version), buf));
    }
    if cur.take(2).is_none() {
        return Ok(None);
    }

    let mut total = 3usize;
    for fixed_after in [8 + 2, 0, 0] {
        let Some(len) = cur.u32() else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_FRAME_LEN {
            return Err(too_large(len));
        }
        total += 4 + len + fixed_after;
        if total > MAX_FRAME_LEN {
            return Err(too_large(total));
        }
        if cur.take(len + fixed_after).is_none() {
            return Ok(None);
        }
    }
    Ok(Some(total))
}

impl WireFormat for LengthPrefixed {
    fn name(&self) -> &'static str {
        NAME
    }

    fn content_type(&self) -> &'static str {
        "application/x-protobuf"
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        let content = message.content.as_deref().unwrap_or_default().as_bytes();
        let id = message.sender_id.as_str().as_bytes();
        let protocol = message.transport.as_str().as_bytes();

        let mut flags = 0;
        if message.content.is_some() {
            flags |= FLAG_CONTENT;
        }
        if message.port.is_some() {
            flags |= FLAG_PORT;
        }

        let mut out = Vec::with_capacity(3 + 4 + id.len() + 10 + 4 + protocol.len() + 4 + content.len());
        out.push(VERSION);
        out.push(type_code(message.kind));
        out.push(flags);
        put_field(&mut out, id);
        out.extend_from_slice(&message.timestamp.to_be_bytes());
        out.extend_from_slice(&message.port.unwrap_or(0).to_be_bytes());
        put_field(&mut out, protocol);
        put_field(&mut out, content);
        out
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        scan(buf)
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        let err = |kind| DecodeError::new(NAME, kind, frame);
        let truncated = || err(DecodeErrorKind::Truncated);
        let text = |bytes: &[u8]| {
            std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|_| err(DecodeErrorKind::InvalidUtf8))
        };

        let mut cur = Cursor::new(frame);
        let version = cur.u8().ok_or_else(truncated)?;
        if version != VERSION {
            return Err(err(DecodeErrorKind::BadVersion(version)));
        }
        let kind = match cur.u8().ok_or_else(truncated)? {
            TYPE_MESSAGE => MessageKind::Message,
            TYPE_DISCOVERY => MessageKind::Discovery,
            TYPE_DISCOVERY_RESPONSE => MessageKind::DiscoveryResponse,
            TYPE_KEEPALIVE => MessageKind::Keepalive,
            other => return Err(err(DecodeErrorKind::UnknownType(other.to_string()))),
        };
        let flags = cur.u8().ok_or_else(truncated)?;

        let id_len = cur.u32().ok_or_else(truncated)? as usize;
        let sender = text(cur.take(id_len).ok_or_else(truncated)?)?;
        if sender.is_empty() {
            return Err(err(DecodeErrorKind::Malformed("empty sender".into())));
        }
        let timestamp = cur.u64().ok_or_else(truncated)?;
        let port = cur.u16().ok_or_else(truncated)?;

        let protocol_len = cur.u32().ok_or_else(truncated)? as usize;
        let protocol = text(cur.take(protocol_len).ok_or_else(truncated)?)?;
        let transport = protocol
            .parse()
            .map_err(|_| err(DecodeErrorKind::UnknownTransport(protocol.clone())))?;

        let content_len = cur.u32().ok_or_else(truncated)? as usize;
        let content = text(cur.take(content_len).ok_or_else(truncated)?)?;

        Ok(Message {
            kind,
            sender_id: PeerId::new(sender),
            timestamp,
            transport,
            port: (flags & FLAG_PORT != 0).then_some(port),
            content: (flags & FLAG_CONTENT != 0).then_some(content),
        }
        .normalized())
    }
}
