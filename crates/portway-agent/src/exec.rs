//! Remote command execution
//!
//! Commands run under an interpreter-appropriate shell with optional
//! working directory and sudo prefix. The agent kills the process after
//! `timeout_sec` and reports the timeout in the result; the server's own
//! watchdog only fires when no result arrives at all.

use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use portway_proto::{CmdResult, RunCmdRequest};

/// Interpreters the agent accepts; `tacoscript` only ever applies to
/// scripts, which have no ad-hoc path, so it is rejected here.
const VALID_INTERPRETERS: [&str; 2] = ["cmd", "powershell"];

/// Validate the requested interpreter at RPC ingress.
pub fn validate_interpreter(interpreter: &str) -> Result<(), String> {
    if interpreter.is_empty() {
        return Ok(());
    }
    if interpreter == "tacoscript" {
        return Err("tacoscript interpreter can't be used for commands execution".to_string());
    }
    if !VALID_INTERPRETERS.contains(&interpreter) {
        return Err(format!("unsupported interpreter: {interpreter}"));
    }
    Ok(())
}

fn build_command(req: &RunCmdRequest) -> Command {
    let mut command = match req.interpreter.as_str() {
        "powershell" => {
            let mut c = Command::new("powershell");
            c.arg("-Command").arg(&req.cmd);
            c
        }
        // The default and "cmd" both map to the platform shell.
        _ => {
            if cfg!(windows) {
                let mut c = Command::new("cmd");
                c.arg("/C").arg(&req.cmd);
                c
            } else if req.is_sudo {
                let mut c = Command::new("sudo");
                c.arg("-n").arg("sh").arg("-c").arg(&req.cmd);
                c
            } else {
                let mut c = Command::new("sh");
                c.arg("-c").arg(&req.cmd);
                c
            }
        }
    };

    if !req.cwd.is_empty() {
        command.current_dir(&req.cwd);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// A spawned command awaiting completion.
pub struct RunningCommand {
    pub pid: u32,
    pub started_at: chrono::DateTime<Utc>,
    child: tokio::process::Child,
    jid: String,
    timeout: Duration,
}

/// Spawn the command; fails when the interpreter is rejected or the process
/// cannot start.
pub fn spawn_command(req: &RunCmdRequest) -> Result<RunningCommand, String> {
    validate_interpreter(&req.interpreter)?;

    let mut command = build_command(req);
    let child = command
        .spawn()
        .map_err(|e| format!("failed to start command: {e}"))?;
    let pid = child.id().unwrap_or_default();

    debug!(jid = %req.jid, pid, "command started");
    Ok(RunningCommand {
        pid,
        started_at: Utc::now(),
        child,
        jid: req.jid.clone(),
        timeout: Duration::from_secs(req.timeout_sec.max(1)),
    })
}

impl RunningCommand {
    /// Wait for completion or the timeout; the result is ready to push as
    /// `cmd_result`.
    pub async fn wait(mut self) -> CmdResult {
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.child.wait_with_output()).await;

        match outcome {
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                let status = if output.status.success() {
                    "successful"
                } else {
                    "failed"
                };
                CmdResult {
                    jid: self.jid,
                    status: status.to_string(),
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    finished_at: Utc::now(),
                    err: None,
                }
            }
            Ok(Err(e)) => CmdResult {
                jid: self.jid,
                status: "failed".to_string(),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                finished_at: Utc::now(),
                err: Some(format!("failed to collect command output: {e}")),
            },
            Err(_) => {
                warn!(jid = %self.jid, "command timed out");
                // kill_on_drop reaps the process; the result records why.
                CmdResult {
                    jid: self.jid,
                    status: "failed".to_string(),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    finished_at: Utc::now(),
                    err: Some(format!(
                        "command timed out after {} seconds",
                        timeout.as_secs()
                    )),
                }
            }
        }
    }
}
