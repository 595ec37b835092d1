//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use portway_proto::Remote;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary server URL, `http(s)://` or `ws(s)://`.
    pub server: String,
    /// Servers tried after the primary keeps failing, in order.
    pub fallback_servers: Vec<String>,

    /// Pinned server fingerprint (full string or prefix). Empty disables
    /// pinning; a mismatch is fatal.
    pub fingerprint: Option<String>,

    /// Credential, `"id:password"`.
    pub auth: String,

    /// Client id; generated (and persisted under `data_dir`) when unset.
    pub id: Option<String>,
    pub name: Option<String>,
    pub tags: Vec<String>,

    /// Tunnels requested at connect, parsed `Remote` strings.
    pub remotes: Vec<String>,

    /// Application-level ping period, seconds. 0 disables keepalive.
    pub keepalive_sec: u64,

    /// Connection attempts per server before moving on; negative retries
    /// forever.
    pub max_retry_count: i64,
    /// Backoff ceiling, seconds.
    pub max_retry_interval_sec: u64,
    /// Switchback probe period while connected to a fallback, seconds.
    pub server_switchback_interval_sec: u64,

    /// Upstream proxy URL (`http://` CONNECT or `socks5://`).
    pub proxy: Option<String>,
    /// Extra headers for the upgrade request, `"Name: Value"` strings.
    pub headers: Vec<String>,
    /// `Host` header override.
    pub hostname: Option<String>,

    /// Where the generated client id is persisted across restarts.
    pub data_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            fallback_servers: Vec::new(),
            fingerprint: None,
            auth: String::new(),
            id: None,
            name: None,
            tags: Vec::new(),
            remotes: Vec::new(),
            keepalive_sec: 0,
            max_retry_count: -1,
            max_retry_interval_sec: 5 * 60,
            server_switchback_interval_sec: 2 * 60,
            proxy: None,
            headers: Vec::new(),
            hostname: None,
            data_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server URL is required".to_string()));
        }
        if !self.auth.contains(':') {
            return Err(ConfigError::Invalid(
                "auth must be in the form \"id:password\"".to_string(),
            ));
        }
        self.parsed_remotes()?;
        self.parsed_headers()?;
        Ok(())
    }

    /// `(auth_id, password)`.
    pub fn auth_parts(&self) -> (String, String) {
        match self.auth.split_once(':') {
            Some((id, password)) => (id.to_string(), password.to_string()),
            None => (self.auth.clone(), String::new()),
        }
    }

    pub fn parsed_remotes(&self) -> Result<Vec<Remote>, ConfigError> {
        self.remotes
            .iter()
            .map(|raw| {
                let remote: Remote = raw
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("remote {raw:?}: {e}")))?;
                remote
                    .validate()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(remote)
            })
            .collect()
    }

    pub fn parsed_headers(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.headers
            .iter()
            .map(|raw| {
                raw.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .filter(|(name, _)| !name.is_empty())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "invalid header {raw:?}: expected \"Name: Value\""
                        ))
                    })
            })
            .collect()
    }

    /// All servers, primary first.
    pub fn servers(&self) -> Vec<String> {
        let mut servers = vec![self.server.clone()];
        servers.extend(self.fallback_servers.iter().cloned());
        servers
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_sec > 0).then(|| Duration::from_secs(self.keepalive_sec))
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval_sec.max(1))
    }

    pub fn switchback_interval(&self) -> Duration {
        Duration::from_secs(self.server_switchback_interval_sec.max(1))
    }

    pub fn max_attempts(&self) -> Option<usize> {
        (self.max_retry_count >= 0).then(|| self.max_retry_count as usize)
    }

    /// Resolve the client id: explicit config, a previously persisted id in
    /// `data_dir`, or a fresh uuid (persisted when possible).
    pub fn resolve_id(&self) -> Result<String, ConfigError> {
        if let Some(id) = &self.id {
            return Ok(id.clone());
        }

        let id_file = self.data_dir.as_ref().map(|dir| dir.join("client_id"));
        if let Some(path) = &id_file {
            if let Ok(existing) = std::fs::read_to_string(path) {
                let existing = existing.trim().to_string();
                if !existing.is_empty() {
                    return Ok(existing);
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        if let Some(path) = &id_file {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &id)?;
        }
        Ok(id)
    }

    /// Load the YAML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Invalid(format!("invalid config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            server: "http://server:8080".to_string(),
            auth: "agent:pw".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.server = String::new();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.auth = "no-colon".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.remotes = vec!["not-a-remote".to_string()];
        assert!(config.validate().is_err());

        let mut config = valid();
        config.headers = vec!["NoColonHere".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn auth_split() {
        let config = valid();
        let (id, password) = config.auth_parts();
        assert_eq!(id, "agent");
        assert_eq!(password, "pw");
    }

    #[test]
    fn servers_order() {
        let mut config = valid();
        config.fallback_servers = vec!["http://b".to_string(), "http://c".to_string()];
        assert_eq!(
            config.servers(),
            vec!["http://server:8080", "http://b", "http://c"]
        );
    }

    #[test]
    fn generated_id_persists_in_data_dir() {
        let dir = std::env::temp_dir().join(format!("portway-agent-id-{}", std::process::id()));
        let mut config = valid();
        config.data_dir = Some(dir.clone());

        let first = config.resolve_id().unwrap();
        let second = config.resolve_id().unwrap();
        assert_eq!(first, second);

        config.id = Some("explicit".to_string());
        assert_eq!(config.resolve_id().unwrap(), "explicit");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn keepalive_zero_disables() {
        let mut config = valid();
        assert!(config.keepalive().is_none());
        config.keepalive_sec = 30;
        assert_eq!(config.keepalive(), Some(Duration::from_secs(30)));
    }
}
