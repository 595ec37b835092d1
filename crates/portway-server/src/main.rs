//! portwayd - the portway server binary

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portway_server::auth::{
    parse_auth_pair, ClientAuthProvider, DbAuthProvider, FileAuthProvider, SingleAuthProvider,
};
use portway_server::jobs::{DbJobProvider, JobManager, MemoryJobProvider};
use portway_server::ports::PortPool;
use portway_server::registry::{ClientRegistry, DbClientProvider};
use portway_server::{PortwayServer, ServerConfig};
use portway_server_db::{AuthStore, ClientStore, JobStore};
use portway_transport::{WsListener, WsListenerConfig};

/// Portway server - accepts agent connections, runs reverse tunnels and
/// remote commands.
#[derive(Parser, Debug)]
#[command(name = "portwayd")]
#[command(about = "Portway server", version)]
struct Args {
    /// Listen address for agent connections (host:port)
    #[arg(long, env = "PORTWAY_ADDRESS")]
    address: Option<String>,

    /// Seed for the deterministic host key
    #[arg(long, env = "PORTWAY_KEY_SEED")]
    key_seed: Option<String>,

    /// Static client credential, "id:password"
    #[arg(long, env = "PORTWAY_AUTH")]
    auth: Option<String>,

    /// JSON file with client credentials
    #[arg(long)]
    auth_file: Option<PathBuf>,

    /// Tunnel port pool, e.g. "20000-30000"
    #[arg(long)]
    used_ports: Option<String>,

    /// Ports excluded from the pool
    #[arg(long)]
    excluded_ports: Option<String>,

    /// Data directory for the SQLite database
    #[arg(long, env = "PORTWAY_DATA_DIR")]
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
fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            ServerConfig::from_file(path).map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(key_seed) = &args.key_seed {
        config.key_seed = key_seed.clone();
    }
    if let Some(auth) = &args.auth {
        config.auth = Some(auth.clone());
    }
    if let Some(auth_file) = &args.auth_file {
        config.auth_file = Some(auth_file.clone());
    }
    if let Some(used_ports) = &args.used_ports {
        config.used_ports = used_ports.clone();
    }
    if let Some(excluded_ports) = &args.excluded_ports {
        config.excluded_ports = excluded_ports.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = Some(data_dir.clone());
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_config(&args)?;

    // Optional persistence.
    let db = match &config.data_dir {
        Some(data_dir) => Some(
            portway_server_db::connect(data_dir)
                .await
                .context("failed to open database")?,
        ),
        None => None,
    };

    // Auth provider, exactly one source.
    let auth: Arc<dyn ClientAuthProvider> = if let Some(raw) = &config.auth {
        let pair = parse_auth_pair(raw).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Arc::new(SingleAuthProvider::new(pair))
    } else if let Some(path) = &config.auth_file {
        Arc::new(
            FileAuthProvider::load(path.clone(), config.auth_write)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        )
    } else {
        let conn = db
            .clone()
            .context("auth_table requires data_dir")?;
        Arc::new(DbAuthProvider::new(AuthStore::new(conn), config.auth_write))
    };

    // Registry, cold-started from the database when present.
    let registry = Arc::new(ClientRegistry::new(
        config.keep_lost(),
        db.clone().map(|conn| {
            Arc::new(DbClientProvider::new(
                ClientStore::new(conn),
                config.keep_lost(),
            )) as Arc<dyn portway_server::registry::ClientProvider>
        }),
    ));
    registry
        .load()
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Jobs.
    let jobs = match db.clone() {
        Some(conn) => JobManager::new(
            Arc::new(DbJobProvider::new(JobStore::new(conn))),
            config.run_remote_cmd_timeout_sec,
        ),
        None => JobManager::new(
            Arc::new(MemoryJobProvider::default()),
            config.run_remote_cmd_timeout_sec,
        ),
    };

    // Tunnel port pool.
    let used = config.used_ports().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let excluded = config
        .excluded_ports()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let ports = Arc::new(PortPool::new(&used, &excluded));
    info!(pool = ports.pool_size(), "tunnel port pool ready");

    // Listener.
    let addr = config
        .address
        .parse()
        .context("invalid listen address")?;
    let listener = WsListener::bind(
        addr,
        WsListenerConfig {
            tls_cert_path: config.tls_cert_path.clone(),
            tls_key_path: config.tls_key_path.clone(),
        },
    )
    .await
    .context("failed to bind control listener")?;

    let server = PortwayServer::new(config, registry, auth, jobs, ports);
    info!(fingerprint = %server.identity.fingerprint(), "portwayd ready");

    // Graceful shutdown on SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    server.run(listener, shutdown_rx).await;
    info!("portwayd stopped");
    Ok(())
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
