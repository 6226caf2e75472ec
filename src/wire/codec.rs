use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

use super::WireFormat;
use crate::error::DecodeError;
use crate::protocol::Message;

/// Stream framing over any [`WireFormat`].
///
/// A frame that is delimited correctly but fails to decode comes out as an
/// `Err` item so the reader can log it and keep going. Only a stream that
/// can no longer be split into frames is an I/O error.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    format: Arc<dyn WireFormat>,
}

impl FrameCodec {
    pub fn new(format: Arc<dyn WireFormat>) -> Self {
        Self { format }
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Message, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.format.frame_len(src) {
            Ok(Some(len)) => {
                let frame = src.split_to(len);
                Ok(Some(self.format.decode_frame(&frame)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&self.format.encode(&item));
        Ok(())
    }
}
