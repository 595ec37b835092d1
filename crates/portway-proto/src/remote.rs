//! Tunnel `Remote` specification
//!
//! A `Remote` describes one reverse tunnel: the server-side listener address
//! and the target the agent dials for every accepted connection. The string
//! form accepted on the agent command line and in the API is
//! `[scheme://][local-interface:][local-port:]remote-host:remote-port`, down
//! to a bare `remote-port`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default idle timeout applied when a tunnel does not set its own.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const DEFAULT_LOCAL_HOST: &str = "0.0.0.0";
const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";

/// Declarative spec of a tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Remote {
    /// Per-agent sequence id, assigned by the server when the tunnel starts.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub local_host: String,
    /// 0 until the server assigns a port for `lport_random` remotes.
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Allowed source IPv4 addresses / CIDRs; empty admits everyone.
    #[serde(default)]
    pub acl: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_minutes: Option<u64>,
    #[serde(default)]
    pub skip_idle_timeout: bool,
    /// True when the caller left the local port blank.
    #[serde(default)]
    pub lport_random: bool,
    /// Rewrite HTTP request heads for `http`/`https` schemes.
    #[serde(default)]
    pub http_proxy: bool,
}

/// Remote parse and validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum RemoteParseError {
    #[error("invalid remote {0:?}: expected [scheme://][local-host:][local-port:]remote-host:remote-port")]
    Malformed(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid idle timeout: {0} minutes exceeds 7 days")]
    IdleTimeoutTooLarge(u64),

    #[error("conflicting tunnel parameters: idle-timeout-minutes and skip-idle-timeout are mutually exclusive")]
    IdleTimeoutConflict,
}

impl Remote {
    /// Target address the agent dials, `"host:port"`.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Server listener address, `"host:port"`.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// True when `scheme` makes this tunnel an HTTP proxy candidate.
    pub fn is_http_scheme(&self) -> bool {
        matches!(self.scheme.as_deref(), Some("http") | Some("https"))
    }

    /// Effective idle timeout; `None` when idle expiry is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.skip_idle_timeout {
            return None;
        }
        Some(
            self.idle_timeout_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
        )
    }

    /// Reject inconsistent parameter combinations.
    pub fn validate(&self) -> Result<(), RemoteParseError> {
        if self.skip_idle_timeout && self.idle_timeout_minutes.is_some() {
            return Err(RemoteParseError::IdleTimeoutConflict);
        }
        if let Some(minutes) = self.idle_timeout_minutes {
            if minutes > 7 * 24 * 60 {
                return Err(RemoteParseError::IdleTimeoutTooLarge(minutes));
            }
        }
        Ok(())
    }
}

fn parse_port(s: &str) -> Result<u16, RemoteParseError> {
    let port: u16 = s
        .parse()
        .map_err(|_| RemoteParseError::InvalidPort(s.to_string()))?;
    if port == 0 {
        return Err(RemoteParseError::InvalidPort(s.to_string()));
    }
    Ok(port)
}

impl FromStr for Remote {
    type Err = RemoteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_string()), rest),
            None => (None, s),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let mut remote = Remote {
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            remote_host: DEFAULT_REMOTE_HOST.to_string(),
            scheme,
            ..Default::default()
        };

        match parts.as_slice() {
            [port] => {
                remote.remote_port = parse_port(port)?;
                remote.lport_random = true;
            }
            [host, port] => {
                remote.remote_host = (*host).to_string();
                remote.remote_port = parse_port(port)?;
                remote.lport_random = true;
            }
            [local_port, host, port] => {
                remote.local_port = parse_port(local_port)?;
                remote.remote_host = (*host).to_string();
                remote.remote_port = parse_port(port)?;
            }
            [local_host, local_port, host, port] => {
                remote.local_host = (*local_host).to_string();
                remote.local_port = parse_port(local_port)?;
                remote.remote_host = (*host).to_string();
                remote.remote_port = parse_port(port)?;
            }
            _ => return Err(RemoteParseError::Malformed(s.to_string())),
        }

        if remote.remote_host.is_empty() || remote.local_host.is_empty() {
            return Err(RemoteParseError::Malformed(s.to_string()));
        }

        Ok(remote)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}://", scheme)?;
        }
        if self.lport_random && self.local_port == 0 {
            write!(f, "{}:{}", self.remote_host, self.remote_port)
        } else {
            write!(
                f,
                "{}:{}:{}:{}",
                self.local_host, self.local_port, self.remote_host, self.remote_port
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_port() {
        let r: Remote = "3000".parse().unwrap();
        assert_eq!(r.remote_host, "127.0.0.1");
        assert_eq!(r.remote_port, 3000);
        assert!(r.lport_random);
        assert_eq!(r.local_port, 0);
    }

    #[test]
    fn parse_host_port() {
        let r: Remote = "example.com:3000".parse().unwrap();
        assert_eq!(r.remote_host, "example.com");
        assert_eq!(r.remote_port, 3000);
        assert!(r.lport_random);
    }

    #[test]
    fn parse_local_port_form() {
        let r: Remote = "3000:google.com:80".parse().unwrap();
        assert_eq!(r.local_host, "0.0.0.0");
        assert_eq!(r.local_port, 3000);
        assert_eq!(r.remote_host, "google.com");
        assert_eq!(r.remote_port, 80);
        assert!(!r.lport_random);
    }

    #[test]
    fn parse_full_form_with_scheme() {
        let r: Remote = "https://192.168.0.5:3000:intra:443".parse().unwrap();
        assert_eq!(r.scheme.as_deref(), Some("https"));
        assert_eq!(r.local_host, "192.168.0.5");
        assert_eq!(r.local_port, 3000);
        assert_eq!(r.remote_addr(), "intra:443");
        assert!(r.is_http_scheme());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Remote>().is_err());
        assert!("a:b:c:d:e".parse::<Remote>().is_err());
        assert!("notaport".parse::<Remote>().is_err());
        assert!("0".parse::<Remote>().is_err());
    }

    #[test]
    fn idle_timeout_defaults_and_conflict() {
        let mut r: Remote = "3000".parse().unwrap();
        assert_eq!(r.idle_timeout(), Some(DEFAULT_IDLE_TIMEOUT));

        r.idle_timeout_minutes = Some(1);
        assert_eq!(r.idle_timeout(), Some(Duration::from_secs(60)));
        assert!(r.validate().is_ok());

        r.skip_idle_timeout = true;
        assert_eq!(r.validate(), Err(RemoteParseError::IdleTimeoutConflict));

        r.idle_timeout_minutes = None;
        assert!(r.validate().is_ok());
        assert_eq!(r.idle_timeout(), None);
    }

    #[test]
    fn display_roundtrip() {
        for s in ["3000:google.com:80", "192.168.0.5:3000:google.com:80"] {
            let r: Remote = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
            assert_eq!(r.to_string().parse::<Remote>().unwrap(), r);
        }
    }
}
