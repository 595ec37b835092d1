//! Multiplexing frames for the control link
//!
//! Every WebSocket binary message is one frame:
//! `stream_id (4) | kind (1) | flags (1) | length (4) | payload`. Stream 0
//! carries control messages; other streams carry tunnel channel data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Stream identifier.
pub type StreamId = u32;

/// Frame kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Control = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Control),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Close),
            _ => Err(MuxError::InvalidFrameKind(value)),
        }
    }
}

/// Frame flags. FIN marks the last frame of a direction, ACK acknowledges
/// a channel open, RST an abortive close; the current protocol carries them
/// on the wire but signals channel lifecycle through control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A single multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream_id (4) + kind (1) + flags (1) + length (4).
    pub const HEADER_SIZE: usize = 10;

    pub fn control(payload: Bytes) -> Self {
        Self {
            stream_id: crate::CONTROL_STREAM_ID,
            kind: FrameKind::Control,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
            flags: FrameFlags::new().with_fin(),
            payload: Bytes::new(),
        }
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the frame into a single buffer.
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        if self.payload.len() > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        Ok(buf.freeze())
    }

    /// Decode one frame from a complete buffer (one WebSocket message).
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let kind = FrameKind::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }
        if buf.remaining() < length as usize {
            return Err(MuxError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);
        Ok(Self {
            stream_id,
            kind,
            flags,
            payload,
        })
    }
}

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid frame kind: {0}")]
    InvalidFrameKind(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("incomplete frame")]
    IncompleteFrame,
}

/// Which end of the link this peer is. Channel ids are odd on the agent side
/// and even on the server side so both peers may open channels concurrently
/// without collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Agent,
    Server,
}

/// Allocator for locally-opened channel ids.
#[derive(Debug)]
pub struct ChannelIds {
    next: AtomicU32,
}

impl ChannelIds {
    pub fn new(side: Side) -> Self {
        let first = match side {
            Side::Agent => 1,
            Side::Server => 2,
        };
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Hand out the next id for this side, skipping the control stream on
    /// wrap-around.
    pub fn next(&self) -> StreamId {
        loop {
            let id = self.next.fetch_add(2, Ordering::Relaxed);
            if id != crate::CONTROL_STREAM_ID {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::data(42, Bytes::from("hello world"));
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(decoded.payload, Bytes::from("hello world"));
    }

    #[test]
    fn close_frame_has_empty_payload_and_fin() {
        let encoded = Frame::close(7).encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.kind, FrameKind::Close);
        assert!(decoded.payload.is_empty());
        assert!(decoded.flags.has_fin());
        assert!(!decoded.flags.has_rst());
    }

    #[test]
    fn flags_survive_the_roundtrip() {
        let frame = Frame::data(3, Bytes::from_static(b"x"))
            .with_flags(FrameFlags::new().with_ack().with_rst());

        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        assert!(decoded.flags.has_ack());
        assert!(decoded.flags.has_rst());
        assert!(!decoded.flags.has_fin());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let encoded = Frame::data(1, Bytes::from("payload")).encode().unwrap();
        let truncated = encoded.slice(..encoded.len() - 2);
        assert!(matches!(
            Frame::decode(truncated),
            Err(MuxError::IncompleteFrame)
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        buf.put_u8(0);
        buf.put_u32(0);
        assert!(matches!(
            Frame::decode(buf.freeze()),
            Err(MuxError::InvalidFrameKind(9))
        ));
    }

    #[test]
    fn channel_ids_keep_parity() {
        let agent = ChannelIds::new(Side::Agent);
        let server = ChannelIds::new(Side::Server);

        for _ in 0..10 {
            assert_eq!(agent.next() % 2, 1);
            let id = server.next();
            assert_eq!(id % 2, 0);
            assert_ne!(id, crate::CONTROL_STREAM_ID);
        }
    }
}
