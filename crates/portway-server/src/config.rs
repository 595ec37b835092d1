//! Server configuration
//!
//! Values come from a YAML config file merged under command-line flags;
//! the flags win. `validate` enforces the combinations the rest of the
//! server relies on (exactly one auth source, a usable port pool).

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::ports::parse_port_spec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for agent connections, `host:port`.
    pub address: String,

    /// Seed the host key derives from. The fingerprint agents pin follows
    /// from this value, so changing it strands every pinned agent.
    pub key_seed: String,

    /// Static credential `"id:password"`. Exactly one of `auth`,
    /// `auth_file`, `auth_table` must be set.
    pub auth: Option<String>,
    /// JSON file of id -> password.
    pub auth_file: Option<PathBuf>,
    /// Use the `client_auths` database table (requires `data_dir`).
    pub auth_table: bool,
    /// Allow credential mutation through the API (file/table only).
    pub auth_write: bool,

    /// Allow one credential to be shared by many client ids, and a second
    /// handshake with an active id to displace the first link.
    pub auth_multiuse_creds: bool,
    /// Derive the client id from the auth id when the agent sends none.
    pub equate_clientauthid_clientid: bool,

    /// Tunnel listener port pool, e.g. `"20000-30000"`.
    pub used_ports: String,
    /// Ports carved out of the pool, e.g. `"20022,20080-20090"`.
    pub excluded_ports: String,

    /// Where the SQLite database lives; no persistence when unset.
    pub data_dir: Option<PathBuf>,

    /// How long disconnected clients stay visible, seconds. Unset keeps
    /// them forever.
    pub keep_lost_clients_sec: Option<u64>,
    /// Period of the obsolete-client sweeper.
    pub cleanup_clients_interval_sec: u64,

    /// Upper bound for a single control request payload.
    pub max_request_bytes: usize,

    /// Default command timeout.
    pub run_remote_cmd_timeout_sec: u64,

    /// Timeout handed to the agent for `check_port` probes.
    pub check_port_timeout_ms: u64,

    /// TLS for the agent listener; both or neither.
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            key_seed: String::new(),
            auth: None,
            auth_file: None,
            auth_table: false,
            auth_write: false,
            auth_multiuse_creds: true,
            equate_clientauthid_clientid: false,
            used_ports: "20000-30000".to_string(),
            excluded_ports: String::new(),
            data_dir: None,
            keep_lost_clients_sec: None,
            cleanup_clients_interval_sec: 60,
            max_request_bytes: 512 * 1024,
            run_remote_cmd_timeout_sec: crate::jobs::DEFAULT_CMD_TIMEOUT_SEC,
            check_port_timeout_ms: 2000,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Validation(format!("invalid address {:?}: {e}", self.address)))?;

        if self.key_seed.is_empty() {
            return Err(Error::Validation(
                "key_seed must be set; agents pin the fingerprint derived from it".to_string(),
            ));
        }

        let sources =
            self.auth.is_some() as u8 + self.auth_file.is_some() as u8 + self.auth_table as u8;
        if sources != 1 {
            return Err(Error::Validation(
                "exactly one of auth, auth_file, auth_table must be configured".to_string(),
            ));
        }
        if self.auth_table && self.data_dir.is_none() {
            return Err(Error::Validation(
                "auth_table requires data_dir".to_string(),
            ));
        }
        if self.auth_write && self.auth.is_some() {
            return Err(Error::Validation(
                "auth_write has no effect with a static auth credential".to_string(),
            ));
        }

        let used = self.used_ports()?;
        let excluded = self.excluded_ports()?;
        if used.difference(&excluded).next().is_none() {
            return Err(Error::Validation(
                "used_ports minus excluded_ports leaves no tunnel ports".to_string(),
            ));
        }

        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(Error::Validation(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }

        Ok(())
    }

    pub fn used_ports(&self) -> Result<BTreeSet<u16>> {
        parse_port_spec(&self.used_ports)
    }

    pub fn excluded_ports(&self) -> Result<BTreeSet<u16>> {
        parse_port_spec(&self.excluded_ports)
    }

    pub fn keep_lost(&self) -> Option<ChronoDuration> {
        self.keep_lost_clients_sec
            .map(|secs| ChronoDuration::seconds(secs as i64))
    }

    /// Load the YAML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("failed to read config {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Validation(format!("invalid config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            key_seed: "seed".to_string(),
            auth: Some("agent:pw".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn auth_sources_are_exclusive() {
        let mut config = valid();
        config.auth_file = Some("auth.json".into());
        assert!(config.validate().is_err());

        config.auth = None;
        config.auth_file = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auth_table_needs_data_dir() {
        let mut config = valid();
        config.auth = None;
        config.auth_table = true;
        assert!(config.validate().is_err());

        config.data_dir = Some("/tmp/portway".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_pool_is_rejected() {
        let mut config = valid();
        config.used_ports = "20000-20010".to_string();
        config.excluded_ports = "20000-20010".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_seed_is_required() {
        let mut config = valid();
        config.key_seed = String::new();
        assert!(config.validate().is_err());
    }
}
