//! Chunked message framing.
//!
//! Each message is a sequence of chunks, every chunk a 2-byte big-endian
//! length followed by that many payload bytes, terminated by an empty chunk
//! (`0x00 0x00`). A zero-length chunk anywhere but at end-of-message is a
//! framing violation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Response;
use super::packstream::{decode, Value};
use crate::error::Error;

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// The end-of-message terminator.
pub const END_OF_MESSAGE: [u8; 2] = [0x00, 0x00];

/// Default ceiling on a reassembled message (16 MiB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Framing codec: encodes message payloads into chunks, reassembles chunked
/// responses into [`Response`] values.
#[derive(Debug)]
pub struct MessageCodec {
    assembling: BytesMut,
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            assembling: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// Split an encoded message into chunks followed by the terminator. A
    /// payload of length L emits ⌈L/65535⌉ payload chunks plus the
    /// terminator.
    pub fn write_chunked(payload: &[u8], dst: &mut BytesMut) {
        dst.reserve(payload.len() + (payload.len() / MAX_CHUNK_SIZE + 1) * 2 + 2);
        for chunk in payload.chunks(MAX_CHUNK_SIZE) {
            dst.put_u16(chunk.len() as u16);
            dst.put_slice(chunk);
        }
        dst.put_slice(&END_OF_MESSAGE);
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        Self::write_chunked(&payload, dst);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, Error> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let chunk_len = u16::from_be_bytes([src[0], src[1]]) as usize;

            if chunk_len == 0 {
                if self.assembling.is_empty() {
                    // Terminator with nothing accumulated: an empty chunk
                    // outside end-of-message position.
                    return Err(Error::Protocol(
                        "empty chunk at message start".to_string(),
                    ));
                }
                src.advance(2);
                let payload = self.assembling.split();
                let value = decode(&payload)?;
                let structure = match value {
                    Value::Structure(s) => s,
                    other => {
                        return Err(Error::Protocol(format!(
                            "message payload is {} rather than a structure",
                            other.type_name()
                        )))
                    }
                };
                return Ok(Some(Response::from_structure(structure)?));
            }

            if src.len() < 2 + chunk_len {
                return Ok(None);
            }
            if self.assembling.len() + chunk_len > self.max_message_size {
                return Err(Error::Protocol(format!(
                    "message exceeds {} byte limit",
                    self.max_message_size
                )));
            }
            src.advance(2);
            self.assembling.extend_from_slice(&src[..chunk_len]);
            src.advance(chunk_len);
        }
    }
}
