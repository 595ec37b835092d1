//! Control-link session layer
//!
//! Turns a raw [`portway_transport::Transport`] into the multiplexed
//! session both sides use: stream channels for tunnel data plus JSON global
//! requests with an `(ok, body)` reply envelope. Also provides the
//! exponential backoff manager the agent's connection loop runs on.

pub mod reconnect;
pub mod session;

pub use reconnect::Backoff;
pub use session::{
    handshake, ChannelReceiver, ChannelSender, ChannelStream, IncomingChannel, IncomingRequest,
    Session, SessionError, SessionEvent,
};
