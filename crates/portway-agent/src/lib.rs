//! Portway agent
//!
//! The agent keeps one outbound control link to a portway server, re-dials
//! with backoff when it drops, fails over to fallback servers, and probes
//! the primary for switchback. Over the link it serves tunnel channels
//! (dial target, pipe bytes) and the command/probe RPCs.

pub mod client;
pub mod config;
pub mod conn_loop;
pub mod exec;
pub mod facts;

pub use client::{connect_once, ConnectError, EstablishedConn};
pub use config::AgentConfig;
pub use conn_loop::run_agent;
