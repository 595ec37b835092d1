//! Connection supervisor
//!
//! Retries the current server with exponential backoff, gives up on it
//! after the configured attempt budget and rotates to the next one, and
//! while connected to a fallback probes the primary for switchback. Fatal
//! handshake outcomes (fingerprint mismatch, rejected credentials,
//! duplicate id) abort the loop. SIGHUP short-circuits the backoff sleep.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use portway_connection::Backoff;
use portway_transport::{dial, DialOptions};

use crate::client::{self, ConnectError, ConnectionEnd};
use crate::config::AgentConfig;

/// Pause before trying the next server after a 503 or a spent attempt
/// budget.
const SERVER_ADVANCE_DELAY: Duration = Duration::from_secs(1);

/// SIGHUP listener; a no-op stream off unix.
struct Hup {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Hup {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let signal =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();
            Hup { signal }
        }
        #[cfg(not(unix))]
        {
            Hup {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            match &mut self.signal {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await
        }
    }
}

/// Run the agent until shutdown. `Err` carries a fatal error message; the
/// binary turns it into a non-zero exit.
pub async fn run_agent(
    config: AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    config.validate().map_err(|e| e.to_string())?;
    let client_id = config.resolve_id().map_err(|e| e.to_string())?;

    let servers = config.servers();
    let switchback_interval = config.switchback_interval();
    let mut current = 0usize;
    let mut backoff = Backoff::new(config.max_retry_interval(), config.max_attempts());
    let mut hangup = Hup::new();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let url = servers[current].clone();
        info!(server = %url, client_id = %client_id, "connecting");

        match client::connect_once(&config, &url, &client_id).await {
            Ok(conn) => {
                info!(server = %url, "connected");
                let connected_at = Instant::now();
                let session = conn.session.clone();

                let end = if current != 0 {
                    // On a fallback: race the link against the switchback
                    // prober.
                    tokio::select! {
                        end = client::run_connection(conn, &config, shutdown.clone()) => Some(end),
                        _ = probe_primary(&config, &servers[0], switchback_interval) => {
                            info!(primary = %servers[0], "primary reachable again; switching back");
                            session.close();
                            None
                        }
                    }
                } else {
                    Some(client::run_connection(conn, &config, shutdown.clone()).await)
                };

                match end {
                    Some(ConnectionEnd::Shutdown) => return Ok(()),
                    Some(ConnectionEnd::Dropped) => {
                        // A link that held long enough resets the budget.
                        if connected_at.elapsed() >= switchback_interval {
                            backoff.reset();
                        }
                        warn!(server = %url, "connection lost");
                    }
                    None => {
                        current = 0;
                        backoff.reset();
                    }
                }
            }

            Err(ConnectError::Fatal(msg)) => {
                warn!(server = %url, error = %msg, "fatal connection error");
                return Err(msg);
            }

            Err(ConnectError::ServiceUnavailable(msg)) => {
                warn!(server = %url, error = %msg, "server unavailable; advancing");
                current = (current + 1) % servers.len();
                backoff.reset();
                if sleep_interruptible(SERVER_ADVANCE_DELAY, &mut shutdown, &mut hangup).await {
                    return Ok(());
                }
            }

            Err(ConnectError::Transient(msg)) => match backoff.next_delay() {
                Some(delay) => {
                    info!(
                        server = %url,
                        error = %msg,
                        retry_in = ?delay,
                        attempt = backoff.attempt(),
                        "connection failed"
                    );
                    if sleep_interruptible(delay, &mut shutdown, &mut hangup).await {
                        return Ok(());
                    }
                }
                None => {
                    current = (current + 1) % servers.len();
                    backoff.reset();
                    info!(next = %servers[current], "retry budget spent; advancing server");
                    if sleep_interruptible(SERVER_ADVANCE_DELAY, &mut shutdown, &mut hangup).await
                    {
                        return Ok(());
                    }
                }
            },
        }
    }
}

/// Sleep, unless shutdown fires (true) or SIGHUP short-circuits the wait
/// (false, immediately).
async fn sleep_interruptible(
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
    hangup: &mut Hup,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
        _ = hangup.recv() => {
            info!("SIGHUP received; retrying immediately");
            false
        }
    }
}

/// Resolves once the primary accepts a transport handshake again. Probes
/// only dial; registration stays with the live fallback link until the
/// switch actually happens.
async fn probe_primary(config: &AgentConfig, primary: &str, interval: Duration) {
    let headers = config.parsed_headers().unwrap_or_default();
    loop {
        tokio::time::sleep(interval).await;
        let opts = DialOptions {
            url: primary.to_string(),
            headers: headers.clone(),
            hostname: config.hostname.clone(),
            proxy: config.proxy.clone(),
            timeout: Duration::from_secs(10),
        };
        match dial(&opts).await {
            Ok(mut transport) => {
                let _ = transport.close().await;
                return;
            }
            Err(e) => {
                tracing::debug!(primary = %primary, error = %e, "switchback probe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let config = AgentConfig::default();
        assert!(run_agent(config, rx).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let (tx, rx) = watch::channel(false);
        let config = AgentConfig {
            // Nothing listens here; every attempt fails fast.
            server: "ws://127.0.0.1:9".to_string(),
            auth: "a:b".to_string(),
            ..Default::default()
        };

        let task = tokio::spawn(run_agent(config, rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("agent must exit promptly on shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
