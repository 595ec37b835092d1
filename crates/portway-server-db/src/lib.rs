//! Persistence for the portway server
//!
//! Clients, client-auth credentials and jobs live in a SQLite database whose
//! schema is evolved by the embedded [`migrator::Migrator`] at startup. The
//! stores speak in plain record shapes (`id` + JSON details) so the server
//! crate owns the domain types and this crate owns the rows.

pub mod entities;
pub mod migrator;
pub mod store;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub use store::{AuthStore, ClientRecord, ClientStore, JobRecord, JobStore, StoreError};

/// Open (creating if necessary) the server database under `data_dir` and
/// bring the schema up to date.
pub async fn connect(data_dir: &Path) -> Result<DatabaseConnection, StoreError> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| StoreError::Internal(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join("portway.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());

    let mut options = ConnectOptions::new(url);
    options
        .max_connections(5)
        .connect_timeout(Duration::from_secs(5));

    let conn = Database::connect(options).await?;
    migrator::Migrator::up(&conn, None).await?;

    info!(path = %db_path.display(), "database ready");
    Ok(conn)
}

/// In-memory database for tests. A single pooled connection, or every
/// checkout would see its own empty database.
pub async fn connect_in_memory() -> Result<DatabaseConnection, StoreError> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1);
    let conn = Database::connect(options).await?;
    migrator::Migrator::up(&conn, None).await?;
    Ok(conn)
}
