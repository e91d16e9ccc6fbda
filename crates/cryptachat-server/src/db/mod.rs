//! Database module for the Cryptachat server
//!
//! A thin libSQL layer with embedded schema migrations and a health check.
//! All state lives in one SQLite database: users, public keys, chat requests
//! and the message log.

mod migrations;

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use libsql::{Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub use migrations::MigrationRunner;

/// How long a file connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database.
///
/// Every `:memory:` connection in libSQL is its own database, so in-memory
/// databases keep one persistent connection that all callers share.
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
    persistent: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Failed to create database directory: {}",
                        e
                    ))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path).build().await?;

        // WAL is a property of the file, so one connection is enough to set it.
        let conn = db.connect()?;
        let mut rows = conn.query("PRAGMA journal_mode=WAL", ()).await?;
        let journal_mode = match rows.next().await? {
            Some(row) => row.get::<String>(0)?,
            None => String::new(),
        };
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal_mode, "Database did not switch to WAL");
        }

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
            persistent: None,
        })
    }

    /// Open `path` if given, otherwise an in-memory database.
    pub async fn open(name: &str, path: Option<&str>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => Self::open_local(name, path).await,
            None => Self::in_memory(name).await,
        }
    }

    /// Get a connection: the shared one for in-memory databases, a fresh one otherwise.
    ///
    /// Fresh connections wait up to [`BUSY_TIMEOUT`] for a competing writer.
    pub async fn connection(&self) -> Result<ConnectionGuard<'_>, DatabaseError> {
        match &self.persistent {
            Some(persistent) => Ok(ConnectionGuard::Persistent(persistent.lock().await)),
            None => {
                let conn = self.db.connect()?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(ConnectionGuard::Owned(conn))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.connection().await?;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Either the shared in-memory connection or an owned file connection.
pub enum ConnectionGuard<'a> {
    Persistent(MutexGuard<'a, Connection>),
    Owned(Connection),
}

impl Deref for ConnectionGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ConnectionGuard::Persistent(guard) => guard,
            ConnectionGuard::Owned(conn) => conn,
        }
    }
}
