//! Control message types
//!
//! Everything on stream 0 is a bincode-encoded [`ControlMessage`]. Global
//! request and reply payloads are JSON so that the REST layer and the agent
//! exchange the same document shapes the API exposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::Remote;

/// Global request names understood by the server.
pub mod requests {
    /// agent -> server: identity + requested remotes, sent once after auth.
    pub const CONNECTION_REQUEST: &str = "connection_request";
    /// server -> agent: probe reachability of a target address.
    pub const CHECK_PORT: &str = "check_port";
    /// server -> agent: execute a command.
    pub const RUN_CMD: &str = "run_cmd";
    /// agent -> server: completion of a previously dispatched command.
    pub const CMD_RESULT: &str = "cmd_result";
    /// server -> agent: ask for a fresh updates-status push.
    pub const REFRESH_UPDATES_STATUS: &str = "refresh_updates_status";
    /// agent -> server: pushed updates status.
    pub const UPDATES_STATUS: &str = "updates_status";
    /// either direction: liveness probe, empty payload.
    pub const PING: &str = "ping";
}

/// Control-stream protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// First message on the link, agent -> server.
    Hello { nonce: [u8; 32] },
    /// Server proves possession of the host key by signing the hello nonce.
    ServerHello {
        public_key: [u8; 32],
        signature: Vec<u8>,
        version: String,
    },
    /// Agent credential, from `--auth id:pass`.
    AuthRequest { auth_id: String, password: String },
    AuthOk,
    /// Fatal on the agent side: credentials will not get better by retrying.
    AuthFailure { reason: String },

    /// A global request. `payload` is JSON.
    Request {
        id: u64,
        name: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Reply to a global request. JSON body on success, a plain UTF-8 error
    /// string when `ok` is false.
    Reply {
        id: u64,
        ok: bool,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Open a tunnel data channel; `target` is `"remote_host:remote_port"`.
    ChannelOpen { stream_id: u32, target: String },
    ChannelAccept { stream_id: u32 },
    ChannelReject { stream_id: u32, reason: String },
}

// Compact byte-array encoding for request/reply payloads.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// The `connection_request` payload: full agent identity plus the remotes the
/// agent wants established. Array fields always serialize as arrays so the
/// registry round-trips empty lists as `[]`, never `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_arch: String,
    #[serde(default)]
    pub os_family: String,
    #[serde(default)]
    pub os_kernel: String,
    #[serde(default)]
    pub os_full_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub os_virtualization_system: String,
    #[serde(default)]
    pub os_virtualization_role: String,
    #[serde(default)]
    pub cpu_family: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub cpu_model_name: String,
    #[serde(default)]
    pub cpu_vendor: String,
    #[serde(default)]
    pub num_cpus: u32,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub remotes: Vec<Remote>,
}

/// `check_port` request payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckPortRequest {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

/// `check_port` reply body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckPortReply {
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// `run_cmd` request payload. The jid lets the agent correlate the later
/// `cmd_result` push with the job the server persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCmdRequest {
    pub jid: String,
    pub cmd: String,
    #[serde(default)]
    pub interpreter: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub is_sudo: bool,
    pub timeout_sec: u64,
}

/// `run_cmd` reply body: the command was started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCmdReply {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// `cmd_result` payload pushed by the agent when the command finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdResult {
    pub jid: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// One pending OS update, part of [`UpdatesStatus`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub is_security_update: bool,
}

/// `updates_status` payload pushed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatesStatus {
    pub refreshed_at: DateTime<Utc>,
    #[serde(default)]
    pub updates_available: u32,
    #[serde(default)]
    pub security_updates_available: u32,
    #[serde(default)]
    pub update_summaries: Vec<UpdateSummary>,
    #[serde(default)]
    pub reboot_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_roundtrip() {
        let msg = ControlMessage::Request {
            id: 7,
            name: requests::PING.to_string(),
            payload: b"{}".to_vec(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ControlMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn connection_request_empty_arrays_stay_arrays() {
        let req = ConnectionRequest {
            id: "client-1".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["ipv4"], serde_json::json!([]));
        assert_eq!(json["tags"], serde_json::json!([]));
        assert_eq!(json["remotes"], serde_json::json!([]));

        let back: ConnectionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn connection_request_tolerates_missing_fields() {
        let back: ConnectionRequest = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert_eq!(back.id, "x");
        assert!(back.ipv6.is_empty());
        assert_eq!(back.num_cpus, 0);
    }

    #[test]
    fn cmd_result_optional_fields() {
        let json = r#"{"jid":"j1","status":"successful","finished_at":"2024-01-01T00:00:00Z"}"#;
        let res: CmdResult = serde_json::from_str(json).unwrap();
        assert_eq!(res.status, "successful");
        assert_eq!(res.exit_code, None);
        assert!(res.err.is_none());
    }
}
