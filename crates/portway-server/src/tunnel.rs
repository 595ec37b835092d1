//! Tunnel engine
//!
//! A [`Tunnel`] owns one server-side listener. The accept loop checks each
//! inbound peer against the ACL, opens a fresh channel on the agent session
//! with the dial target, and pipes bytes both ways. Per-connection copiers
//! are children of the accept task and are drained with a bounded grace
//! period at teardown. Teardown is idempotent.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use portway_connection::{ChannelSender, Session};
use portway_proto::{Acl, Remote};

use crate::http_proxy;

/// Copy buffer per direction.
const COPY_BUFFER: usize = 16 * 1024;
/// How long to wait for the agent to accept a channel.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for in-flight connections at teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(3);

/// Byte counters and the shared activity clock of one tunnel.
pub struct TunnelStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_activity_ms: AtomicU64,
    epoch: Instant,
}

impl TunnelStats {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Monotonic time since the last byte in either direction.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// A running tunnel instance.
pub struct Tunnel {
    pub remote: Remote,
    pub created_at: DateTime<Utc>,
    stats: Arc<TunnelStats>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Tunnel {
    /// Start the accept loop on an already-bound listener. `remote` must
    /// carry its assigned id and resolved `local_port`.
    pub fn start(
        remote: Remote,
        listener: TcpListener,
        session: Session,
        acl: Option<Acl>,
    ) -> Arc<Self> {
        let stats = TunnelStats::new();
        stats.touch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let proxy_target = (remote.is_http_scheme() && remote.http_proxy)
            .then(|| remote.remote_addr());

        let handle = tokio::spawn(accept_loop(
            listener,
            remote.clone(),
            session,
            acl,
            stats.clone(),
            proxy_target,
            shutdown_rx,
        ));

        Arc::new(Self {
            remote,
            created_at: Utc::now(),
            stats,
            shutdown_tx,
            accept_task: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Effective idle timeout of this tunnel.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.remote.idle_timeout()
    }

    /// Close the listener, cancel copiers and wait for the accept task.
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(TEARDOWN_GRACE + Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!(
                    tunnel_id = %self.remote.id,
                    "tunnel accept task did not drain in time"
                );
            }
        }

        info!(
            tunnel_id = %self.remote.id,
            local_port = self.remote.local_port,
            bytes_in = self.stats.bytes_in(),
            bytes_out = self.stats.bytes_out(),
            "tunnel closed"
        );
    }
}

async fn accept_loop(
    listener: TcpListener,
    remote: Remote,
    session: Session,
    acl: Option<Acl>,
    stats: Arc<TunnelStats>,
    proxy_target: Option<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let target = remote.remote_addr();
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        connections.retain(|handle| !handle.is_finished());

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    if let Some(acl) = &acl {
                        if !acl.allows(peer.ip()) {
                            debug!(tunnel_id = %remote.id, peer = %peer, "connection rejected by ACL");
                            drop(conn);
                            continue;
                        }
                    }

                    debug!(tunnel_id = %remote.id, peer = %peer, target = %target, "tunnel connection accepted");
                    connections.push(tokio::spawn(handle_connection(
                        conn,
                        session.clone(),
                        target.clone(),
                        proxy_target.clone(),
                        stats.clone(),
                        shutdown_rx.clone(),
                    )));
                }
                // Accept errors do not tear the tunnel down; only a dead
                // listener would, and then accept keeps failing into here.
                Err(e) => {
                    warn!(tunnel_id = %remote.id, error = %e, "tunnel accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    // The listener closes now; drain children within the grace period.
    drop(listener);
    let deadline = tokio::time::Instant::now() + TEARDOWN_GRACE;
    for mut handle in connections {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

/// One accepted connection: open a channel to the dial target and copy both
/// directions until either side finishes.
async fn handle_connection(
    conn: TcpStream,
    session: Session,
    target: String,
    proxy_target: Option<String>,
    stats: Arc<TunnelStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let channel = match session.open_channel(&target, CHANNEL_OPEN_TIMEOUT).await {
        Ok(channel) => channel,
        Err(e) => {
            debug!(target = %target, error = %e, "failed to open tunnel channel");
            return;
        }
    };
    let (tx, rx) = channel.split();

    let (mut read_half, mut write_half) = conn.into_split();

    let result: Result<(), ()> = async {
        let mut rx = rx;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut inbound_done = false;

        // Proxy mode: rewrite the first request head before anything flows.
        if let Some(proxy_target) = &proxy_target {
            match forward_rewritten_head(&mut read_half, &tx, proxy_target, &stats).await {
                Ok(done) => inbound_done = done,
                Err(()) => return Err(()),
            }
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),

                read = read_half.read(&mut buf), if !inbound_done => match read {
                    Ok(0) => inbound_done = true,
                    Ok(n) => {
                        stats.add_in(n as u64);
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "tunnel read error");
                        return Err(());
                    }
                },

                received = rx.recv() => match received {
                    Some(data) => {
                        stats.add_out(data.len() as u64);
                        if write_half.write_all(&data).await.is_err() {
                            return Err(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    let _ = write_half.shutdown().await;
    tx.close().await;
    if result.is_err() {
        debug!(target = %target, "tunnel connection ended with error");
    }
}

/// Buffer the first request head, rewrite it, forward it together with any
/// body bytes already read. Returns whether the inbound side already hit
/// EOF.
async fn forward_rewritten_head(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    tx: &ChannelSender,
    proxy_target: &str,
    stats: &TunnelStats,
) -> Result<bool, ()> {
    let mut head_buf = Vec::with_capacity(1024);
    let mut chunk = vec![0u8; 2048];
    let mut eof = false;

    let boundary = loop {
        if let Some(end) = http_proxy::head_end(&head_buf) {
            break Some(end);
        }
        if head_buf.len() > http_proxy::MAX_HEAD_SIZE {
            break None;
        }
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                eof = true;
                break None;
            }
            Ok(n) => head_buf.extend_from_slice(&chunk[..n]),
            Err(_) => return Err(()),
        }
    };

    stats.add_in(head_buf.len() as u64);

    match boundary {
        Some(end) => {
            let rewritten = http_proxy::rewrite_head(&head_buf[..end], proxy_target)
                .unwrap_or_else(|| head_buf[..end].to_vec());
            let mut out = rewritten;
            out.extend_from_slice(&head_buf[end..]);
            if tx.send(Bytes::from(out)).await.is_err() {
                return Err(());
            }
        }
        None if !head_buf.is_empty() => {
            // Not parseable as HTTP; pass the bytes through untouched.
            if tx.send(Bytes::from(head_buf)).await.is_err() {
                return Err(());
            }
        }
        None => {}
    }

    Ok(eof)
}
