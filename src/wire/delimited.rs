use super::{line_frame_len, text_body, WireFormat};
use crate::error::{DecodeError, DecodeErrorKind};
use crate::peer::PeerId;
use crate::protocol::{Message, MessageKind};

const NAME: &str = "delimited";
const SEPARATOR: char = '|';
const FIELDS: usize = 6;

/// `type|sender|timestamp|transport|port|content`, one message per line.
///
/// Content is the last field so it may contain the separator. Backslashes
/// and line breaks in content are escaped to keep the frame on one line.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedText;

impl WireFormat for DelimitedText {
    fn name(&self) -> &'static str {
        NAME
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        let port = message.port.map(|p| p.to_string()).unwrap_or_default();
        let content = message.content.as_deref().map(escape).unwrap_or_default();
        format!(
            "{kind}{sep}{sender}{sep}{ts}{sep}{transport}{sep}{port}{sep}{content}\n",
            kind = message.kind,
            sender = message.sender_id,
            ts = message.timestamp,
            transport = message.transport,
            port = port,
            content = content,
            sep = SEPARATOR,
        )
        .into_bytes()
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        line_frame_len(NAME, buf)
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        let malformed = |why: &str| DecodeError::new(NAME, DecodeErrorKind::Malformed(why.to_string()), frame);

        let line = text_body(NAME, frame)?;
        let fields: Vec<&str> = line.splitn(FIELDS, SEPARATOR).collect();
        let &[kind, sender, timestamp, transport, port, content] = fields.as_slice() else {
            return Err(malformed("wrong number of fields"));
        };

        let kind: MessageKind = kind
            .parse()
            .map_err(|k| DecodeError::new(NAME, DecodeErrorKind::UnknownType(k), frame))?;
        if sender.is_empty() {
            return Err(malformed("empty sender"));
        }
        let timestamp = timestamp.parse().map_err(|_| malformed("bad timestamp"))?;
        let transport = transport
            .parse()
            .map_err(|_| DecodeError::new(NAME, DecodeErrorKind::UnknownTransport(transport.to_string()), frame))?;
        let port = match port {
            "" => None,
            p => Some(p.parse().map_err(|_| malformed("bad port"))?),
        };
        let content = match kind {
            MessageKind::Message => Some(unescape(content)),
            _ => None,
        };

        Ok(Message {
            kind,
            sender_id: PeerId::new(sender),
            timestamp,
            transport,
            port,
            content,
        })
    }
}

fn escape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
