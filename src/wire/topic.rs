use super::{WireFormat, MAX_FRAME_LEN};
use crate::error::{DecodeError, DecodeErrorKind};
use crate::protocol::Message;

const NAME: &str = "topic";
const TOPIC_ROOT: &str = "p2p";

/// Publish-style framing: a topic derived from the message, then a JSON
/// payload, each behind a big-endian `u32` length. No broker is involved;
/// the topic only exercises subscription-style addressing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicAddressed;

impl TopicAddressed {
    /// `p2p/discovery/<transport>` for discovery traffic,
    /// `p2p/messages/<sender>` for everything else.
    pub fn topic_for(message: &Message) -> String {
        if message.kind.is_discovery() {
            format!("{}/discovery/{}", TOPIC_ROOT, message.transport)
        } else {
            format!("{}/messages/{}", TOPIC_ROOT, message.sender_id)
        }
    }
}

fn read_len(buf: &[u8], at: usize) -> Option<usize> {
    let raw = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
}

impl WireFormat for TopicAddressed {
    fn name(&self) -> &'static str {
        NAME
    }

    fn content_type(&self) -> &'static str {
        "application/mqtt"
    }

    fn encode(&self, message: &Message) -> Vec<u8> {
        let topic = Self::topic_for(message);
        let payload = serde_json::to_vec(message).unwrap_or_default();

        let mut out = Vec::with_capacity(8 + topic.len() + payload.len());
        out.extend_from_slice(&(topic.len() as u32).to_be_bytes());
        out.extend_from_slice(topic.as_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        let too_large = |n| DecodeError::new(NAME, DecodeErrorKind::TooLarge(n), buf);

        let Some(topic_len) = read_len(buf, 0) else {
            return Ok(None);
        };
        if topic_len > MAX_FRAME_LEN {
            return Err(too_large(topic_len));
        }
        let Some(payload_len) = read_len(buf, 4 + topic_len) else {
            return Ok(None);
        };
        let total = 8 + topic_len + payload_len;
        if payload_len > MAX_FRAME_LEN || total > MAX_FRAME_LEN {
            return Err(too_large(total));
        }
        Ok((buf.len() >= total).then_some(total))
    }

    fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        let err = |kind| DecodeError::new(NAME, kind, frame);

        let topic_len = read_len(frame, 0).ok_or_else(|| err(DecodeErrorKind::Truncated))?;
        let topic = frame
            .get(4..4 + topic_len)
            .ok_or_else(|| err(DecodeErrorKind::Truncated))?;
        let topic = std::str::from_utf8(topic).map_err(|_| err(DecodeErrorKind::InvalidUtf8))?;
        let payload = frame
            .get(8 + topic_len..)
            .ok_or_else(|| err(DecodeErrorKind::Truncated))?;

        let message: Message = serde_json::from_slice(payload)
            .map_err(|e| err(DecodeErrorKind::Malformed(e.to_string())))?;

        let expected = Self::topic_for(&message);
        if topic != expected {
            return Err(err(DecodeErrorKind::Malformed(format!(
                "topic {:?} does not match payload, expected {:?}",
                topic, expected
            ))));
        }
        Ok(message.normalized())
    }
}
