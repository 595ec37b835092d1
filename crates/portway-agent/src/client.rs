//! One connection lifetime
//!
//! `connect_once` performs the whole handshake: dial (optionally through a
//! proxy), verify the server's host key against the pinned fingerprint,
//! authenticate, exchange the connection request. `run_connection` then
//! serves the established session: keepalive pings, tunnel channels and
//! the command/probe RPCs.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use portway_connection::{
    handshake, IncomingChannel, IncomingRequest, Session, SessionError, SessionEvent,
};
use portway_proto::{
    identity, requests, CheckPortReply, CheckPortRequest, ControlMessage, Remote, Side,
    UpdatesStatus,
};
use portway_transport::{dial, DialOptions};

use crate::config::AgentConfig;
use crate::exec;
use crate::facts;

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RESULT_PUSH_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const COPY_BUFFER: usize = 16 * 1024;

/// How a connection attempt failed.
#[derive(Debug)]
pub enum ConnectError {
    /// Never retry: fingerprint mismatch, rejected credentials, duplicate
    /// id.
    Fatal(String),
    /// The server is up but refusing service; advance to the next one.
    ServiceUnavailable(String),
    /// Everything else: dial, TLS, protocol; retried with backoff.
    Transient(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Fatal(msg) => write!(f, "fatal: {msg}"),
            ConnectError::ServiceUnavailable(msg) => write!(f, "unavailable: {msg}"),
            ConnectError::Transient(msg) => write!(f, "{msg}"),
        }
    }
}

/// A fully established control link.
#[derive(Debug)]
pub struct EstablishedConn {
    pub session: Session,
    pub events: mpsc::Receiver<SessionEvent>,
    pub accepted_remotes: Vec<Remote>,
}

/// Why a running connection ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Graceful shutdown was requested.
    Shutdown,
    /// The link dropped or keepalive failed.
    Dropped,
}

/// Dial `url` and complete the handshake.
pub async fn connect_once(
    config: &AgentConfig,
    url: &str,
    client_id: &str,
) -> Result<EstablishedConn, ConnectError> {
    let headers = config
        .parsed_headers()
        .map_err(|e| ConnectError::Fatal(e.to_string()))?;
    let remotes = config
        .parsed_remotes()
        .map_err(|e| ConnectError::Fatal(e.to_string()))?;

    let opts = DialOptions {
        url: url.to_string(),
        headers,
        hostname: config.hostname.clone(),
        proxy: config.proxy.clone(),
        timeout: Duration::from_secs(30),
    };
    let mut transport = dial(&opts).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("503") {
            ConnectError::ServiceUnavailable(msg)
        } else {
            ConnectError::Transient(msg)
        }
    })?;

    // Host-key proof before anything else leaves this agent.
    let nonce = identity::hello_nonce();
    handshake::send(transport.as_mut(), &ControlMessage::Hello { nonce })
        .await
        .map_err(|e| ConnectError::Transient(e.to_string()))?;

    let (public_key, signature) =
        match handshake::recv(transport.as_mut(), HANDSHAKE_STEP_TIMEOUT).await {
            Ok(ControlMessage::ServerHello {
                public_key,
                signature,
                version: _,
            }) => (public_key, signature),
            Ok(other) => {
                return Err(ConnectError::Transient(format!(
                    "unexpected handshake message: {other:?}"
                )))
            }
            Err(e) => return Err(ConnectError::Transient(e.to_string())),
        };

    let fingerprint = identity::verify_server_hello(
        &public_key,
        &signature,
        &nonce,
        config.fingerprint.as_deref(),
    )
    .map_err(|e| ConnectError::Fatal(e.to_string()))?;
    debug!(fingerprint = %fingerprint, "server identity verified");

    // Credentials.
    let (auth_id, password) = config.auth_parts();
    handshake::send(
        transport.as_mut(),
        &ControlMessage::AuthRequest { auth_id, password },
    )
    .await
    .map_err(|e| ConnectError::Transient(e.to_string()))?;

    match handshake::recv(transport.as_mut(), HANDSHAKE_STEP_TIMEOUT).await {
        Ok(ControlMessage::AuthOk) => {}
        Ok(ControlMessage::AuthFailure { reason }) => {
            return Err(ConnectError::Fatal(format!("authentication failed: {reason}")))
        }
        Ok(other) => {
            return Err(ConnectError::Transient(format!(
                "unexpected auth reply: {other:?}"
            )))
        }
        Err(e) => return Err(ConnectError::Transient(e.to_string())),
    }

    // Identity + requested remotes over the running mux.
    let (session, events) = Session::start(transport, Side::Agent);

    let mut request = facts::connection_request();
    request.id = client_id.to_string();
    request.name = config.name.clone().unwrap_or_default();
    request.tags = config.tags.clone();
    request.remotes = remotes;

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => {
            session.close();
            return Err(ConnectError::Fatal(format!(
                "failed to encode connection request: {e}"
            )));
        }
    };

    let accepted = match session
        .request(
            requests::CONNECTION_REQUEST,
            payload,
            CONNECTION_REQUEST_TIMEOUT,
        )
        .await
    {
        Ok(body) => match serde_json::from_slice::<Vec<Remote>>(&body) {
            Ok(accepted) => accepted,
            Err(e) => {
                session.close();
                return Err(ConnectError::Transient(format!(
                    "invalid connection reply: {e}"
                )));
            }
        },
        Err(SessionError::Remote(msg)) => {
            session.close();
            // Duplicate-id rejections will not clear up by retrying.
            if msg.contains("already connected") {
                return Err(ConnectError::Fatal(msg));
            }
            return Err(ConnectError::Transient(msg));
        }
        Err(e) => {
            session.close();
            return Err(ConnectError::Transient(e.to_string()));
        }
    };

    for remote in &accepted {
        info!(
            tunnel_id = %remote.id,
            local = %remote.local_addr(),
            remote = %remote.remote_addr(),
            "tunnel established"
        );
    }

    Ok(EstablishedConn {
        session,
        events,
        accepted_remotes: accepted,
    })
}

/// Serve the established session until it ends or shutdown is requested.
pub async fn run_connection(
    conn: EstablishedConn,
    config: &AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) -> ConnectionEnd {
    let EstablishedConn {
        session,
        mut events,
        ..
    } = conn;

    let keepalive = config.keepalive();
    let mut ping_interval =
        tokio::time::interval(keepalive.unwrap_or(Duration::from_secs(3600)));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutting down control link");
                session.close();
                return ConnectionEnd::Shutdown;
            }

            _ = ping_interval.tick(), if keepalive.is_some() => {
                // Missing replies for two intervals means the link is dead.
                let deadline = keepalive.unwrap_or_default() * 2;
                if let Err(e) = session.request(requests::PING, b"{}".to_vec(), deadline).await {
                    warn!(error = %e, "keepalive failed; dropping link");
                    session.close();
                    return ConnectionEnd::Dropped;
                }
            }

            event = events.recv() => match event {
                Some(SessionEvent::Request(request)) => {
                    handle_request(&session, request).await;
                }
                Some(SessionEvent::Channel(incoming)) => {
                    let session = session.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_channel(session, incoming, shutdown).await;
                    });
                }
                Some(SessionEvent::Closed) | None => {
                    info!("control link closed by server");
                    return ConnectionEnd::Dropped;
                }
            }
        }
    }
}

async fn handle_request(session: &Session, request: IncomingRequest) {
    let reply = match request.name.as_str() {
        requests::PING => Ok(Vec::new()),
        requests::RUN_CMD => handle_run_cmd(session, &request.payload).await,
        requests::CHECK_PORT => handle_check_port(&request.payload).await,
        requests::REFRESH_UPDATES_STATUS => {
            spawn_updates_push(session.clone());
            Ok(Vec::new())
        }
        other => Err(format!("unknown request: {other}")),
    };

    if session.reply(request.id, reply).await.is_err() {
        debug!("failed to reply; session gone");
    }
}

async fn handle_run_cmd(session: &Session, payload: &[u8]) -> Result<Vec<u8>, String> {
    let request: portway_proto::RunCmdRequest =
        serde_json::from_slice(payload).map_err(|e| format!("invalid run_cmd request: {e}"))?;

    let running = exec::spawn_command(&request)?;
    let ack = portway_proto::RunCmdReply {
        pid: running.pid,
        started_at: running.started_at,
    };
    let body = serde_json::to_vec(&ack).map_err(|e| e.to_string())?;

    // Push the result when the command finishes, whatever it turns into.
    let session = session.clone();
    tokio::spawn(async move {
        let result = running.wait().await;
        let payload = match serde_json::to_vec(&result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode command result");
                return;
            }
        };
        if let Err(e) = session
            .request(requests::CMD_RESULT, payload, RESULT_PUSH_TIMEOUT)
            .await
        {
            warn!(jid = %result.jid, error = %e, "failed to push command result");
        }
    });

    Ok(body)
}

async fn handle_check_port(payload: &[u8]) -> Result<Vec<u8>, String> {
    let request: CheckPortRequest =
        serde_json::from_slice(payload).map_err(|e| format!("invalid check_port request: {e}"))?;

    let timeout = Duration::from_millis(request.timeout_ms.max(1));
    let attempt = tokio::time::timeout(
        timeout,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await;

    let reply = match attempt {
        Ok(Ok(_stream)) => CheckPortReply {
            open: true,
            err: None,
        },
        Ok(Err(e)) => CheckPortReply {
            open: false,
            err: Some(e.to_string()),
        },
        Err(_) => CheckPortReply {
            open: false,
            err: Some(format!("connect timed out after {}ms", request.timeout_ms)),
        },
    };
    serde_json::to_vec(&reply).map_err(|e| e.to_string())
}

/// Updates probing is not wired into this build; the push reports an empty
/// status so the server's view stays fresh.
fn spawn_updates_push(session: Session) {
    tokio::spawn(async move {
        let status = UpdatesStatus {
            refreshed_at: chrono::Utc::now(),
            updates_available: 0,
            security_updates_available: 0,
            update_summaries: Vec::new(),
            reboot_pending: false,
            error: None,
        };
        let payload = match serde_json::to_vec(&status) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if let Err(e) = session
            .request(requests::UPDATES_STATUS, payload, RESULT_PUSH_TIMEOUT)
            .await
        {
            debug!(error = %e, "failed to push updates status");
        }
    });
}

/// A server-opened tunnel channel: dial the target, then copy both ways.
/// The dial happens before the accept so a dead target turns into a
/// channel rejection the server can log.
async fn serve_channel(session: Session, incoming: IncomingChannel, mut shutdown: watch::Receiver<bool>) {
    let target = incoming.target.clone();
    let dialed = tokio::time::timeout(CHANNEL_DIAL_TIMEOUT, TcpStream::connect(&target)).await;

    let stream = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "tunnel target unreachable");
            let _ = session
                .reject_channel(&incoming, &format!("failed to connect to {target}: {e}"))
                .await;
            return;
        }
        Err(_) => {
            let _ = session
                .reject_channel(&incoming, &format!("connect to {target} timed out"))
                .await;
            return;
        }
    };

    let channel = match session.accept_channel(&incoming).await {
        Ok(channel) => channel,
        Err(e) => {
            debug!(target = %target, error = %e, "failed to accept channel");
            return;
        }
    };
    debug!(target = %target, stream_id = channel.stream_id(), "tunnel channel open");

    let (tx, mut rx) = channel.split();
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut target_done = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            read = read_half.read(&mut buf), if !target_done => match read {
                Ok(0) => target_done = true,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(target = %target, error = %e, "target read error");
                    break;
                }
            },

            received = rx.recv() => match received {
                Some(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = write_half.shutdown().await;
    tx.close().await;
    debug!(target = %target, "tunnel channel closed");
}
