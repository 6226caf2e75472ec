use super::{line_frame_len, text_body, WireFormat};
use crate::error::{DecodeError, DecodeErrorKind};
use crate::protocol::Message;

const NAME: &str = "json";

/// One JSON object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLines;

impl WireFormat for JsonLines {
    fn name(&self) -> &'static str {
        NAME
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        let mut data = serde_json::to_vec(message).unwrap_or_default();
        data.push(b'\n');
        data
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        line_frame_len(NAME, buf)
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        let line = text_body(NAME, frame)?;
        serde_json::from_str(line)
            .map(Message::normalized)
            .map_err(|e| DecodeError::new(NAME, DecodeErrorKind::Malformed(e.to_string()), frame))
    }
}
