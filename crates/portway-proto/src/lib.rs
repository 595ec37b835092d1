//! Portway protocol definitions
//!
//! This crate defines the control-link wire format shared by the server and
//! the agent: the multiplexing frames, the control message set, the tunnel
//! `Remote` specification, tunnel ACLs, and the server host-key identity.

pub mod codec;
pub mod identity;
pub mod ip_filter;
pub mod messages;
pub mod mux;
pub mod remote;

pub use codec::{CodecError, ControlCodec};
pub use identity::{fingerprint_of, HostIdentity, IdentityError};
pub use ip_filter::{Acl, AclError};
pub use messages::*;
pub use mux::{ChannelIds, Frame, FrameFlags, FrameKind, MuxError, Side, StreamId};
pub use remote::{Remote, RemoteParseError};

/// Protocol version carried in the server hello.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for control messages.
pub const CONTROL_STREAM_ID: u32 = 0;
