//! Codec for control messages
//!
//! Control frames carry one bincode-encoded [`ControlMessage`] each; the
//! length prefix lets a future stream transport reuse the same encoding.

use crate::messages::ControlMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Control message codec: `[length: u32 BE][bincode payload]`.
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum encoded message size (16MB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one message from the buffer. Returns `Ok(None)` when more
    /// bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: ControlMessage = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}
