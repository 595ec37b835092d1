//! Server core
//!
//! [`PortwayServer`] ties the registry, auth store, port pool, tunnel
//! engine and job manager together. It owns the map of live control
//! sessions and is the single place tunnels are created and destroyed, so
//! the teardown order (tunnels first, then the registry disconnect mark)
//! holds on every path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use portway_connection::Session;
use portway_proto::{requests, Acl, CheckPortReply, CheckPortRequest, HostIdentity, Remote};

use crate::auth::ClientAuthProvider;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::jobs::{CommandRequest, Job, JobManager, JobStatus};
use crate::ports::PortPool;
use crate::registry::ClientRegistry;
use crate::session::serve_connection;
use crate::tunnel::Tunnel;

/// Timeout for server→agent control RPCs other than commands.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);
/// Poll period while a sequential multi-client command waits for a result.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One live control link.
pub(crate) struct ActiveConn {
    pub token: u64,
    pub session: Session,
    pub tunnels: Arc<AsyncMutex<HashMap<String, Arc<Tunnel>>>>,
}

pub struct PortwayServer {
    pub config: ServerConfig,
    pub identity: HostIdentity,
    pub registry: Arc<ClientRegistry>,
    pub auth: Arc<dyn ClientAuthProvider>,
    pub jobs: Arc<JobManager>,
    pub ports: Arc<PortPool>,
    sessions: Mutex<HashMap<String, ActiveConn>>,
    next_token: AtomicU64,
}

impl PortwayServer {
    pub fn new(
        config: ServerConfig,
        registry: Arc<ClientRegistry>,
        auth: Arc<dyn ClientAuthProvider>,
        jobs: Arc<JobManager>,
        ports: Arc<PortPool>,
    ) -> Arc<Self> {
        let identity = HostIdentity::from_seed(&config.key_seed);
        info!(fingerprint = %identity.fingerprint(), "host key ready");
        Arc::new(Self {
            config,
            identity,
            registry,
            auth,
            jobs,
            ports,
            sessions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Accept agent connections until the listener fails or shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: portway_transport::WsListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let cleanup = tokio::spawn(cleanup_loop(
            self.clone(),
            Duration::from_secs(self.config.cleanup_clients_interval_sec.max(1)),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((transport, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            serve_connection(server, transport, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "listener accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        cleanup.abort();
        self.shutdown_all_sessions().await;
    }

    async fn shutdown_all_sessions(&self) {
        let conns: Vec<(String, ActiveConn)> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().collect()
        };
        for (client_id, conn) in conns {
            self.teardown_conn(&client_id, conn).await;
        }
    }

    /// Whether a client currently holds a live control link.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(client_id)
    }

    pub(crate) fn session_for(&self, client_id: &str) -> Result<Session> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(client_id)
            .map(|c| c.session.clone())
            .ok_or_else(|| Error::Conflict(format!("client {client_id:?} is not connected")))
    }

    /// Reserve the client slot for a fresh handshake. With multi-use
    /// credentials an existing link is displaced and handed back for
    /// teardown; otherwise the newcomer is rejected.
    pub(crate) fn claim_client_slot(
        &self,
        client_id: &str,
        session: Session,
    ) -> Result<(u64, Option<ActiveConn>)> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().unwrap();

        let displaced = match sessions.remove(client_id) {
            Some(existing) => {
                if !self.config.auth_multiuse_creds {
                    // Put it back; the newcomer loses.
                    sessions.insert(client_id.to_string(), existing);
                    return Err(Error::Conflict(format!(
                        "client id {client_id:?} is already connected"
                    )));
                }
                Some(existing)
            }
            None => None,
        };

        sessions.insert(
            client_id.to_string(),
            ActiveConn {
                token,
                session,
                tunnels: Arc::new(AsyncMutex::new(HashMap::new())),
            },
        );
        Ok((token, displaced))
    }

    /// Stop every tunnel of a displaced or ended connection and close it.
    pub(crate) async fn teardown_conn(&self, client_id: &str, conn: ActiveConn) {
        let tunnels: Vec<Arc<Tunnel>> = conn.tunnels.lock().await.drain().map(|(_, t)| t).collect();
        for tunnel in tunnels {
            let port = tunnel.remote.local_port;
            tunnel.stop().await;
            self.ports.release(port);
        }
        conn.session.close();
        debug!(client_id = %client_id, "connection torn down");
    }

    /// End-of-session path: tear tunnels down first, then mark the client
    /// disconnected. A stale token means the slot was already re-claimed by
    /// a reconnect and must be left alone.
    pub(crate) async fn handle_disconnect(&self, client_id: &str, token: u64) {
        let conn = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(client_id) {
                Some(existing) if existing.token == token => sessions.remove(client_id),
                _ => None,
            }
        };

        let Some(conn) = conn else {
            return;
        };
        self.teardown_conn(client_id, conn).await;

        if let Some(mut client) = self.registry.get_by_id(client_id) {
            client.tunnels.clear();
            client.disconnected_at = Some(chrono::Utc::now());
            if let Err(e) = self.registry.save(&client).await {
                warn!(client_id = %client_id, error = %e, "failed to persist disconnect");
            }
        }
        info!(client_id = %client_id, "client disconnected");
    }

    /// Bind the remotes requested in a connection request. Any failure
    /// rolls back the ones already bound and fails the handshake.
    pub(crate) async fn bind_remotes(
        &self,
        client_id: &str,
        token: u64,
        remotes: Vec<Remote>,
    ) -> Result<Vec<Remote>> {
        let mut accepted = Vec::with_capacity(remotes.len());
        for remote in remotes {
            match self.start_tunnel(client_id, token, remote).await {
                Ok(remote) => accepted.push(remote),
                Err(e) => {
                    for bound in &accepted {
                        let _ = self.remove_tunnel(client_id, &bound.id).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(accepted)
    }

    /// API path: create one tunnel, optionally pre-probing the target
    /// through the agent.
    pub async fn create_tunnel(
        self: &Arc<Self>,
        client_id: &str,
        remote: Remote,
        check_remote_port: bool,
    ) -> Result<Remote> {
        remote
            .validate()
            .map_err(|e| Error::Validation(e.to_string()))?;

        if check_remote_port {
            let probe = self
                .check_port(client_id, &remote.remote_host, remote.remote_port)
                .await?;
            if !probe.open {
                return Err(Error::Client(format!(
                    "remote target {} is not reachable from the client: {}",
                    remote.remote_addr(),
                    probe.err.unwrap_or_default()
                )));
            }
        }

        let token = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(client_id)
                .map(|c| c.token)
                .ok_or_else(|| Error::Conflict(format!("client {client_id:?} is not connected")))?
        };
        self.start_tunnel(client_id, token, remote).await
    }

    /// Allocate a listener, start the tunnel, record it on the connection
    /// and in the registry.
    async fn start_tunnel(
        &self,
        client_id: &str,
        token: u64,
        mut remote: Remote,
    ) -> Result<Remote> {
        remote
            .validate()
            .map_err(|e| Error::Validation(e.to_string()))?;

        let acl = if remote.acl.is_empty() {
            None
        } else {
            Some(
                Acl::parse(&remote.acl)
                    .map_err(|e| Error::Validation(e.to_string()))?,
            )
        };

        if remote.local_host.is_empty() {
            remote.local_host = "0.0.0.0".to_string();
        }
        let requested = (remote.local_port != 0).then_some(remote.local_port);
        let (listener, port) = self.ports.allocate(&remote.local_host, requested).await?;
        remote.local_port = port;
        remote.lport_random = requested.is_none();

        let (session, tunnels) = {
            let sessions = self.sessions.lock().unwrap();
            let conn = sessions
                .get(client_id)
                .filter(|c| c.token == token)
                .ok_or_else(|| {
                    Error::Conflict(format!("client {client_id:?} is not connected"))
                })?;
            (conn.session.clone(), conn.tunnels.clone())
        };

        let mut tunnels_guard = tunnels.lock().await;
        let next_id = tunnels_guard
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        remote.id = next_id.to_string();

        let tunnel = Tunnel::start(remote.clone(), listener, session, acl);
        tunnels_guard.insert(remote.id.clone(), tunnel.clone());
        drop(tunnels_guard);

        self.spawn_idle_watcher(client_id.to_string(), tunnel);

        if let Some(mut client) = self.registry.get_by_id(client_id) {
            client.tunnels.retain(|t| t.id != remote.id);
            client.tunnels.push(remote.clone());
            self.registry.save(&client).await?;
        }

        info!(
            client_id = %client_id,
            tunnel_id = %remote.id,
            local = %remote.local_addr(),
            remote = %remote.remote_addr(),
            "tunnel created"
        );
        Ok(remote)
    }

    fn spawn_idle_watcher(&self, client_id: String, tunnel: Arc<Tunnel>) {
        let Some(idle_timeout) = tunnel.idle_timeout() else {
            return;
        };
        let registry = self.registry.clone();
        let ports = self.ports.clone();
        let tunnels_entry = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&client_id).map(|c| c.tunnels.clone())
        };
        let Some(tunnels) = tunnels_entry else {
            return;
        };

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tunnel.is_stopped() {
                    break;
                }
                if tunnel.stats().idle_for() > idle_timeout {
                    info!(
                        client_id = %client_id,
                        tunnel_id = %tunnel.remote.id,
                        "closing idle tunnel"
                    );
                    tunnels.lock().await.remove(&tunnel.remote.id);
                    tunnel.stop().await;
                    ports.release(tunnel.remote.local_port);

                    if let Some(mut client) = registry.get_by_id(&client_id) {
                        client.tunnels.retain(|t| t.id != tunnel.remote.id);
                        let _ = registry.save(&client).await;
                    }
                    break;
                }
            }
        });
    }

    /// API path: close one tunnel.
    pub async fn remove_tunnel(&self, client_id: &str, tunnel_id: &str) -> Result<()> {
        let tunnels = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(client_id)
                .map(|c| c.tunnels.clone())
                .ok_or_else(|| Error::Conflict(format!("client {client_id:?} is not connected")))?
        };

        let tunnel = tunnels
            .lock()
            .await
            .remove(tunnel_id)
            .ok_or_else(|| Error::NotFound(format!("tunnel {tunnel_id}")))?;

        let port = tunnel.remote.local_port;
        tunnel.stop().await;
        self.ports.release(port);

        if let Some(mut client) = self.registry.get_by_id(client_id) {
            client.tunnels.retain(|t| t.id != tunnel_id);
            self.registry.save(&client).await?;
        }
        Ok(())
    }

    /// Probe a target address through the agent.
    pub async fn check_port(&self, client_id: &str, host: &str, port: u16) -> Result<CheckPortReply> {
        let session = self.session_for(client_id)?;
        let request = CheckPortRequest {
            host: host.to_string(),
            port,
            timeout_ms: self.config.check_port_timeout_ms,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Error::Internal(format!("failed to encode check_port: {e}")))?;

        let body = session
            .request(requests::CHECK_PORT, payload, RPC_TIMEOUT)
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Client(format!("invalid check_port reply: {e}")))
    }

    /// API path: run one command on one client.
    pub async fn run_command(
        self: &Arc<Self>,
        client_id: &str,
        req: &CommandRequest,
        created_by: &str,
    ) -> Result<Job> {
        if self.registry.get_active_by_id(client_id).is_none() {
            return Err(Error::NotFound(format!("active client {client_id:?}")));
        }
        let session = self.session_for(client_id)?;
        self.jobs.dispatch(&session, client_id, req, created_by).await
    }

    /// API path: run a command on many clients, sequentially or
    /// concurrently. Sequential mode waits for each job and stops at the
    /// first non-successful one when `abort_on_error`.
    pub async fn run_command_multi(
        self: &Arc<Self>,
        client_ids: &[String],
        req: &CommandRequest,
        execute_concurrently: bool,
        abort_on_error: bool,
        created_by: &str,
    ) -> Result<Vec<Job>> {
        if client_ids.is_empty() {
            return Err(Error::Validation("client_ids must not be empty".to_string()));
        }

        // Validate every target before any dispatch.
        for client_id in client_ids {
            if self.registry.get_active_by_id(client_id).is_none() {
                return Err(Error::NotFound(format!("active client {client_id:?}")));
            }
        }

        let mut jobs = Vec::with_capacity(client_ids.len());
        if execute_concurrently {
            for client_id in client_ids {
                jobs.push(self.run_command(client_id, req, created_by).await?);
            }
        } else {
            for client_id in client_ids {
                let job = self.run_command(client_id, req, created_by).await?;
                let finished = self.wait_for_job(client_id, &job).await?;
                let success = finished.status == JobStatus::Successful;
                jobs.push(finished);
                if abort_on_error && !success {
                    break;
                }
            }
        }
        Ok(jobs)
    }

    async fn wait_for_job(&self, client_id: &str, job: &Job) -> Result<Job> {
        if job.status.is_terminal() {
            return Ok(job.clone());
        }
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(job.timeout_sec) + RPC_TIMEOUT;
        loop {
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
            let current = self.jobs.get(client_id, job.jid).await?;
            if current.status.is_terminal() {
                return Ok(current);
            }
            if tokio::time::Instant::now() > deadline {
                return Ok(current);
            }
        }
    }

    /// API path: ask the agent to refresh its updates status. The agent
    /// pushes the new status asynchronously.
    pub async fn refresh_updates_status(&self, client_id: &str) -> Result<()> {
        let session = self.session_for(client_id)?;
        session
            .request(requests::REFRESH_UPDATES_STATUS, b"{}".to_vec(), RPC_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Periodic sweep wired into [`Self::run`].
    pub async fn cleanup_obsolete(&self) -> Result<usize> {
        let evicted = self.registry.delete_obsolete().await?;
        // Obsolete clients are long disconnected, so their tunnels went
        // down with their session; only the records needed eviction.
        Ok(evicted.len())
    }
}

async fn cleanup_loop(
    server: Arc<PortwayServer>,
    period: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match server.cleanup_obsolete().await {
                    Ok(0) => {}
                    Ok(n) => info!(evicted = n, "purged obsolete clients"),
                    Err(e) => warn!(error = %e, "obsolete-client cleanup failed"),
                }
            }
        }
    }
}
