//! Wire formats: interchangeable codecs between [`Message`] and bytes.
//!
//! Every format produces self-delimiting frames so the same codec works on
//! datagrams (one frame per packet) and on streams (see [`FrameCodec`]).

mod binary;
mod codec;
mod delimited;
mod json;
mod topic;

pub use binary::LengthPrefixed;
pub use codec::FrameCodec;
pub use delimited::DelimitedText;
pub use json::JsonLines;
pub use topic::TopicAddressed;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{DecodeError, DecodeErrorKind};
use crate::peer::{PeerId, TransportKind};
use crate::protocol::Message;

/// Upper bound on a single frame, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub trait WireFormat: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    /// Encode one message as one complete frame.
    fn encode(&self, message: &Message) -> Vec<u8>;

    /// Length of the first complete frame in `buf`. `Ok(None)` means more
    /// bytes are needed; an error means `buf` can never start a valid frame.
    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError>;

    /// Decode exactly one complete frame as delimited by [`frame_len`].
    ///
    /// [`frame_len`]: WireFormat::frame_len
    fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError>;

    /// Decode the first frame in `bytes`; anything after it is ignored.
    fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        match self.frame_len(bytes)? {
            Some(len) => self.decode_frame(&bytes[..len]),
            None => Err(DecodeError::new(self.name(), DecodeErrorKind::Truncated, bytes)),
        }
    }

    fn make_discovery(&self, sender: &PeerId, transport: TransportKind, port: Option<u16>) -> Message {
        Message::discovery(sender, transport, port)
    }

    fn make_discovery_response(
        &self,
        sender: &PeerId,
        transport: TransportKind,
        port: Option<u16>,
    ) -> Message {
        Message::discovery_response(sender, transport, port)
    }

    fn make_message(&self, sender: &PeerId, transport: TransportKind, content: &str) -> Message {
        Message::message(sender, transport, content)
    }

    fn extract_content<'a>(&self, message: &'a Message) -> Option<&'a str> {
        message.content()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum WireFormatKind {
    Delimited,
    #[default]
    Json,
    Binary,
    Topic,
}

impl WireFormatKind {
    pub const ALL: [WireFormatKind; 4] = [
        WireFormatKind::Delimited,
        WireFormatKind::Json,
        WireFormatKind::Binary,
        WireFormatKind::Topic,
    ];

    pub fn build(self) -> Arc<dyn WireFormat> {
        match self {
            WireFormatKind::Delimited => Arc::new(DelimitedText),
            WireFormatKind::Json => Arc::new(JsonLines),
            WireFormatKind::Binary => Arc::new(LengthPrefixed),
            WireFormatKind::Topic => Arc::new(TopicAddressed),
        }
    }
}

impl fmt::Display for WireFormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.build().name())
    }
}

/// Frame boundary for the newline-terminated text formats.
fn line_frame_len(format: &'static str, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    match buf.iter().position(|b| *b == b'\n') {
        Some(end) if end + 1 > MAX_FRAME_LEN => Err(DecodeError::new(
            format,
            DecodeErrorKind::TooLarge(end + 1),
            &buf[..end + 1],
        )),
        Some(end) => Ok(Some(end + 1)),
        None if buf.len() > MAX_FRAME_LEN => Err(DecodeError::new(
            format,
            DecodeErrorKind::TooLarge(buf.len()),
            buf,
        )),
        None => Ok(None),
    }
}

/// Strip the terminating newline of a text frame and check it is utf-8.
fn text_body<'a>(format: &'static str, frame: &'a [u8]) -> Result<&'a str, DecodeError> {
    let body = frame.strip_suffix(b"\n").ok_or_else(|| {
        DecodeError::new(format, DecodeErrorKind::Truncated, frame)
    })?;
    std::str::from_utf8(body).map_err(|_| DecodeError::new(format, DecodeErrorKind::InvalidUtf8, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        let x = PeerId::from("peer-0badf00d");
        vec![
            Message::discovery(&x, TransportKind::Broadcast, Some(6000)),
            Message::discovery_response(&x, TransportKind::Direct, None),
            Message::message(&x, TransportKind::Direct, "hello"),
            Message::message(&x, TransportKind::Service, ""),
            Message::message(&x, TransportKind::Broadcast, "pipes | and\nnewlines \\ ok"),
            Message::keepalive(&x, TransportKind::Direct),
        ]
    }

    #[test]
    fn every_format_round_trips() {
        for kind in WireFormatKind::ALL {
            let format = kind.build();
            for message in samples() {
                let bytes = format.encode(&message);
                assert_eq!(
                    format.decode(&bytes).as_ref(),
                    Ok(&message),
                    "{} failed on {:?}",
                    format.name(),
                    message
                );
                assert_eq!(format.frame_len(&bytes), Ok(Some(bytes.len())));
            }
        }
    }

    #[test]
    fn truncated_frames_are_errors() {
        for kind in WireFormatKind::ALL {
            let format = kind.build();
            for message in samples() {
                let bytes = format.encode(&message);
                for cut in 0..bytes.len() {
                    let err = format
                        .decode(&bytes[..cut])
                        .expect_err(&format!("{} accepted a {}-byte prefix", format.name(), cut));
                    assert_eq!(err.raw, bytes[..cut].to_vec());
                    assert_eq!(err.format, format.name());
                }
            }
        }
    }

    #[test]
    fn garbage_is_an_error() {
        let garbage: [&[u8]; 6] = [
            b"\n",
            b"hello world\n",
            b"\xff\xfe\xfd\n",
            b"{\"type\":\"nope\"}\n",
            &[1, 9, 0, 0, 0, 0, 0],
            &[0, 0, 0, 2, b'x', b'y', 0, 0, 0, 1, b'{'],
        ];
        for kind in WireFormatKind::ALL {
            let format = kind.build();
            for bytes in garbage {
                assert!(format.decode(bytes).is_err(), "{} accepted {:?}", format.name(), bytes);
            }
        }
    }

    #[test]
    fn only_messages_keep_content_after_decoding() {
        let x = PeerId::from("peer-x");
        let mut discovery = Message::discovery(&x, TransportKind::Broadcast, Some(6000));
        discovery.content = Some("stray".into());
        let mut keepalive = Message::keepalive(&x, TransportKind::Direct);
        keepalive.content = Some("stray".into());

        for kind in WireFormatKind::ALL {
            let format = kind.build();
            for message in [&discovery, &keepalive] {
                let decoded = format.decode(&format.encode(message)).unwrap();
                assert_eq!(decoded.content, None, "{} kept content", format.name());
                assert_eq!(decoded.kind, message.kind);
                assert_eq!(decoded.port, message.port);
            }
        }
    }

    #[test]
    fn oversized_frames_are_rejected_on_decode() {
        let x = PeerId::from("peer-x");
        let big = Message::message(&x, TransportKind::Direct, "a".repeat(MAX_FRAME_LEN + 1));
        for kind in WireFormatKind::ALL {
            let format = kind.build();
            let err = format.decode(&format.encode(&big)).unwrap_err();
            assert!(
                matches!(err.kind, DecodeErrorKind::TooLarge(_)),
                "{} gave {:?}",
                format.name(),
                err.kind
            );
        }
    }

    #[test]
    fn decode_takes_the_first_of_concatenated_frames() {
        let x = PeerId::from("peer-x");
        let first = Message::message(&x, TransportKind::Direct, "one");
        let second = Message::message(&x, TransportKind::Direct, "two");
        for kind in WireFormatKind::ALL {
            let format = kind.build();
            let mut bytes = format.encode(&first);
            let split = bytes.len();
            bytes.extend(format.encode(&second));

            assert_eq!(format.frame_len(&bytes), Ok(Some(split)));
            assert_eq!(format.decode(&bytes), Ok(first.clone()));
            assert_eq!(format.decode(&bytes[split..]), Ok(second.clone()));
        }
    }

    #[test]
    fn constructors_and_extraction() {
        let format = WireFormatKind::Json.build();
        let me = PeerId::from("peer-me");
        let msg = format.make_message(&me, TransportKind::Direct, "hi");
        assert_eq!(format.extract_content(&msg), Some("hi"));

        let disc = format.make_discovery(&me, TransportKind::Broadcast, Some(5555));
        assert_eq!(disc.kind, crate::protocol::MessageKind::Discovery);
        assert_eq!(format.extract_content(&disc), None);

        let resp = format.make_discovery_response(&me, TransportKind::Broadcast, Some(5555));
        assert_eq!(resp.kind, crate::protocol::MessageKind::DiscoveryResponse);
        assert_eq!(resp.port, Some(5555));
    }
}
