//! portway - the agent binary
//!
//! Connects out to a portway server, keeps the control link alive and
//! serves reverse tunnels and remote commands. Exits 0 on graceful
//! shutdown, non-zero on fatal configuration, fingerprint or auth errors.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portway_agent::{run_agent, AgentConfig};

/// Portway agent - maintains an outbound control link and reverse tunnels.
#[derive(Parser, Debug)]
#[command(name = "portway")]
#[command(about = "Portway agent", version)]
#[command(long_about = r#"
The portway agent dials the server URL, authenticates, and keeps a
persistent control link through which the server opens reverse tunnels
and runs commands.

Each <remote> requests a tunnel in the form

    [scheme://][local-interface:][local-port:]remote-host:remote-port

down to a bare remote-port; a blank local port asks the server to pick a
random one from its pool.

EXAMPLES:
  portway --auth agent1:secret http://server.example.com:8080 2222:127.0.0.1:22
  portway --config agent.yaml

SIGNALS:
  SIGHUP short-circuits the reconnect backoff timer.
"#)]
struct Args {
    /// Server URL (http(s):// or ws(s)://)
    server: Option<String>,

    /// Requested tunnels
    remotes: Vec<String>,

    /// Pinned server fingerprint (full or prefix); mismatches are fatal
    #[arg(long)]
    fingerprint: Option<String>,

    /// Credentials "id:password"
    #[arg(long, env = "AUTH")]
    auth: Option<String>,

    /// Client id (generated and persisted under --data-dir when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Client display name
    #[arg(long)]
    name: Option<String>,

    /// Tag, repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Fallback server URL, repeatable
    #[arg(long = "fallback-server")]
    fallback_servers: Vec<String>,

    /// Keepalive ping period in seconds (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,

    /// Attempts per server before rotating; negative retries forever
    #[arg(long)]
    max_retry_count: Option<i64>,

    /// Backoff ceiling in seconds
    #[arg(long)]
    max_retry_interval: Option<u64>,

    /// Switchback probe period in seconds
    #[arg(long)]
    server_switchback_interval: Option<u64>,

    /// Upstream proxy URL (http:// CONNECT or socks5://)
    #[arg(long)]
    proxy: Option<String>,

    /// Extra upgrade header "Name: Value", repeatable
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Host header override
    #[arg(long)]
    hostname: Option<String>,

    /// Directory for persisted agent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI flags over the config file; flags win.
fn build_config(args: Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            AgentConfig::from_file(path).map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
        None => AgentConfig::default(),
    };

    if let Some(server) = args.server {
        config.server = server;
    }
    if !args.remotes.is_empty() {
        config.remotes = args.remotes;
    }
    if let Some(fingerprint) = args.fingerprint {
        config.fingerprint = Some(fingerprint);
    }
    if let Some(auth) = args.auth {
        config.auth = auth;
    }
    if let Some(id) = args.id {
        config.id = Some(id);
    }
    if let Some(name) = args.name {
        config.name = Some(name);
    }
    if !args.tags.is_empty() {
        config.tags = args.tags;
    }
    if !args.fallback_servers.is_empty() {
        config.fallback_servers = args.fallback_servers;
    }
    if let Some(keepalive) = args.keepalive {
        config.keepalive_sec = keepalive;
    }
    if let Some(count) = args.max_retry_count {
        config.max_retry_count = count;
    }
    if let Some(interval) = args.max_retry_interval {
        config.max_retry_interval_sec = interval;
    }
    if let Some(interval) = args.server_switchback_interval {
        config.server_switchback_interval_sec = interval;
    }
    if let Some(proxy) = args.proxy {
        config.proxy = Some(proxy);
    }
    if !args.headers.is_empty() {
        config.headers = args.headers;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = Some(hostname);
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = args.log_level.clone();
    if let Err(e) = setup_logging(&log_level) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    match run_agent(config, shutdown_rx).await {
        Ok(()) => info!("agent stopped"),
        Err(e) => {
            error!(error = %e, "agent terminated");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
