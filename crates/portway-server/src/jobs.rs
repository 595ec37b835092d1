//! Jobs: remote command execution records and dispatch
//!
//! A job is created `running` and persisted before the `run_cmd` request
//! goes out. Dispatch failures finalize it as `failed`; the agent's
//! `cmd_result` push finalizes it as `successful`/`failed`; a watchdog
//! closes it as `unknown` when the agent stays silent past `timeout_sec`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portway_connection::Session;
use portway_proto::{requests, CmdResult, RunCmdReply, RunCmdRequest};
use portway_server_db::{JobRecord, JobStore};

use crate::error::{Error, Result};

/// Default for `server.run_remote_cmd_timeout_sec`.
pub const DEFAULT_CMD_TIMEOUT_SEC: u64 = 60;

/// How long the agent gets to acknowledge a `run_cmd` dispatch.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Interpreters commands may request.
pub const VALID_INTERPRETERS: [&str; 3] = ["cmd", "powershell", "tacoscript"];

/// Reject unknown interpreters at ingress; `tacoscript` is only valid for
/// scripts, never ad-hoc commands.
pub fn validate_interpreter(interpreter: &str, is_script: bool) -> Result<()> {
    if interpreter.is_empty() {
        return Ok(());
    }
    if !is_script && interpreter == "tacoscript" {
        return Err(Error::Validation(
            "tacoscript interpreter can't be used for commands execution".to_string(),
        ));
    }
    if !VALID_INTERPRETERS.contains(&interpreter) {
        return Err(Error::Validation(format!(
            "expected interpreter to be one of: {VALID_INTERPRETERS:?}, actual: {interpreter}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Successful,
    Failed,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != JobStatus::Running
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub jid: Uuid,
    pub client_id: String,
    pub command: String,
    #[serde(default)]
    pub interpreter: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub is_sudo: bool,
    pub timeout_sec: u64,
    #[serde(default)]
    pub created_by: String,
    pub status: JobStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Command parameters from the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub is_sudo: bool,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

/// Persistent job storage.
#[async_trait]
pub trait JobProvider: Send + Sync {
    async fn save(&self, job: &Job) -> Result<()>;
    async fn get(&self, client_id: &str, jid: Uuid) -> Result<Option<Job>>;
    async fn list(&self, client_id: &str) -> Result<Vec<Job>>;
}

/// In-memory provider for servers running without a data dir, and tests.
#[derive(Default)]
pub struct MemoryJobProvider {
    jobs: DashMap<Uuid, Job>,
}

#[async_trait]
impl JobProvider for MemoryJobProvider {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.jid, job.clone());
        Ok(())
    }

    async fn get(&self, client_id: &str, jid: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .get(&jid)
            .filter(|j| j.client_id == client_id)
            .map(|j| j.value().clone()))
    }

    async fn list(&self, client_id: &str) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.client_id == client_id)
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

/// sea-orm backed provider; the row's `details` column holds the whole job.
pub struct DbJobProvider {
    store: JobStore,
}

impl DbJobProvider {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    fn to_record(job: &Job) -> Result<JobRecord> {
        Ok(JobRecord {
            jid: job.jid,
            client_id: job.client_id.clone(),
            status: job.status.as_str().to_string(),
            details: serde_json::to_value(job)
                .map_err(|e| Error::Internal(format!("failed to encode job: {e}")))?,
            created_at: job.created_at,
        })
    }

    fn from_record(record: JobRecord) -> Result<Job> {
        serde_json::from_value(record.details)
            .map_err(|e| Error::Internal(format!("corrupt job row {}: {e}", record.jid)))
    }
}

#[async_trait]
impl JobProvider for DbJobProvider {
    async fn save(&self, job: &Job) -> Result<()> {
        self.store.save(&Self::to_record(job)?).await?;
        Ok(())
    }

    async fn get(&self, client_id: &str, jid: Uuid) -> Result<Option<Job>> {
        match self.store.get(client_id, jid).await? {
            Some(record) => Ok(Some(Self::from_record(record)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, client_id: &str) -> Result<Vec<Job>> {
        self.store
            .list_by_client(client_id)
            .await?
            .into_iter()
            .map(Self::from_record)
            .collect()
    }
}

/// Creates, dispatches and finalizes jobs.
pub struct JobManager {
    provider: Arc<dyn JobProvider>,
    default_timeout_sec: u64,
}

impl JobManager {
    pub fn new(provider: Arc<dyn JobProvider>, default_timeout_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            provider,
            default_timeout_sec,
        })
    }

    pub async fn get(&self, client_id: &str, jid: Uuid) -> Result<Job> {
        self.provider
            .get(client_id, jid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {jid}")))
    }

    pub async fn list(&self, client_id: &str) -> Result<Vec<Job>> {
        self.provider.list(client_id).await
    }

    /// Create a running job and send `run_cmd` over the client's session.
    /// Dispatch failures come back as an already-finalized failed job.
    pub async fn dispatch(
        self: &Arc<Self>,
        session: &Session,
        client_id: &str,
        req: &CommandRequest,
        created_by: &str,
    ) -> Result<Job> {
        if req.command.trim().is_empty() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        let interpreter = req.interpreter.clone().unwrap_or_default();
        validate_interpreter(&interpreter, false)?;

        let timeout_sec = req.timeout_sec.unwrap_or(self.default_timeout_sec);
        let mut job = Job {
            jid: Uuid::new_v4(),
            client_id: client_id.to_string(),
            command: req.command.clone(),
            interpreter,
            cwd: req.cwd.clone().unwrap_or_default(),
            is_sudo: req.is_sudo,
            timeout_sec,
            created_by: created_by.to_string(),
            status: JobStatus::Running,
            pid: None,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        };
        self.provider.save(&job).await?;

        let payload = RunCmdRequest {
            jid: job.jid.to_string(),
            cmd: job.command.clone(),
            interpreter: job.interpreter.clone(),
            cwd: job.cwd.clone(),
            is_sudo: job.is_sudo,
            timeout_sec,
        };
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| Error::Internal(format!("failed to encode run_cmd: {e}")))?;

        match session
            .request(requests::RUN_CMD, payload, DISPATCH_TIMEOUT)
            .await
        {
            Ok(body) => {
                let reply: RunCmdReply = serde_json::from_slice(&body).map_err(|e| {
                    Error::Client(format!("invalid run_cmd acknowledgement: {e}"))
                })?;
                job.pid = Some(reply.pid);
                job.started_at = Some(reply.started_at);
                self.provider.save(&job).await?;

                info!(jid = %job.jid, client_id = %client_id, pid = reply.pid, "command dispatched");
                self.spawn_watchdog(job.jid, client_id.to_string(), timeout_sec);
                Ok(job)
            }
            Err(e) => {
                warn!(jid = %job.jid, client_id = %client_id, error = %e, "command dispatch failed");
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                job.finished_at = Some(Utc::now());
                self.provider.save(&job).await?;
                Ok(job)
            }
        }
    }

    /// Close the job as `unknown` when no result arrives in time.
    fn spawn_watchdog(self: &Arc<Self>, jid: Uuid, client_id: String, timeout_sec: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_sec)).await;
            match manager.provider.get(&client_id, jid).await {
                Ok(Some(mut job)) if !job.status.is_terminal() => {
                    job.status = JobStatus::Unknown;
                    job.error = Some(format!(
                        "command did not finish within {timeout_sec} seconds"
                    ));
                    job.finished_at = Some(Utc::now());
                    if let Err(e) = manager.provider.save(&job).await {
                        warn!(jid = %jid, error = %e, "failed to persist job timeout");
                    } else {
                        info!(jid = %jid, client_id = %client_id, "command timed out");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(jid = %jid, error = %e, "job watchdog lookup failed"),
            }
        });
    }

    /// Apply the agent's `cmd_result`. Late results after the watchdog
    /// fired are dropped.
    pub async fn finalize(&self, client_id: &str, result: &CmdResult) -> Result<()> {
        let jid = Uuid::parse_str(&result.jid)
            .map_err(|e| Error::Validation(format!("invalid jid {:?}: {e}", result.jid)))?;

        let mut job = self
            .provider
            .get(client_id, jid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {jid}")))?;

        if job.status.is_terminal() {
            debug!(jid = %jid, status = job.status.as_str(), "dropping late command result");
            return Ok(());
        }

        job.status = match result.status.as_str() {
            "successful" => JobStatus::Successful,
            "failed" => JobStatus::Failed,
            other => {
                debug!(jid = %jid, status = other, "unrecognized result status");
                JobStatus::Unknown
            }
        };
        job.finished_at = Some(result.finished_at);
        job.error = result.err.clone();
        job.result = Some(JobResult {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            summary: match result.exit_code {
                Some(code) => format!("exit code {code}"),
                None => String::new(),
            },
        });
        self.provider.save(&job).await?;

        info!(jid = %jid, client_id = %client_id, status = job.status.as_str(), "job finished");
        Ok(())
    }
}
