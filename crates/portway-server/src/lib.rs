//! Portway server
//!
//! The session and tunnel plane: accepts persistent agent connections,
//! keeps the client registry, runs reverse tunnels and dispatches remote
//! commands. The REST layer consumes [`PortwayServer`] and the registry;
//! it is not part of this crate.

pub mod auth;
pub mod clients;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod jobs;
pub mod ports;
pub mod registry;
pub mod server;
mod session;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{ClientAuth, ClientAuthProvider};
pub use clients::{Client, FilterOption, User};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use jobs::{CommandRequest, Job, JobManager, JobStatus};
pub use registry::ClientRegistry;
pub use server::PortwayServer;
