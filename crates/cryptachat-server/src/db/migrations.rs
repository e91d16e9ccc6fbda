//! Database migration system
//!
//! Migrations are embedded SQL applied in version order. Applied versions are
//! recorded in a `_migrations` table so each runs exactly once.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

const V0001_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS public_keys (
    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    public_key TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const V0002_CHAT_REQUESTS: &str = r#"
CREATE TABLE IF NOT EXISTS chat_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    requested_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'accepted')),
    created_at TEXT NOT NULL,
    UNIQUE (requester_id, requested_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_requests_requested
    ON chat_requests (requested_id, status);
"#;

const V0003_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    recipient_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    sender_blob TEXT NOT NULL,
    recipient_blob TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages (sender_id, recipient_id, id);
"#;

/// All schema migrations, oldest first.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "users and public keys",
            sql: V0001_ACCOUNTS,
        },
        Migration {
            version: 2,
            description: "chat requests",
            sql: V0002_CHAT_REQUESTS,
        },
        Migration {
            version: 3,
            description: "message log",
            sql: V0003_MESSAGES,
        },
    ]
}

/// Applies pending migrations to a database.
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(all())
    }
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// Run all pending migrations, returning the versions applied.
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        let conn = db.connection().await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let applied = applied_versions(&conn).await?;
        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Highest applied version, if any.
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let conn = db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_migrations'",
                (),
            )
            .await?;
        if rows.next().await?.is_none() {
            return Ok(None);
        }
        Ok(applied_versions(&conn).await?.into_iter().max())
    }
}

async fn applied_versions(conn: &libsql::Connection) -> Result<Vec<i64>, DatabaseError> {
    let mut rows = conn
        .query("SELECT version FROM _migrations ORDER BY version", ())
        .await
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e)))?;

    let mut versions = Vec::new();
    while let Some(row) = rows.next().await? {
        versions.push(row.get::<i64>(0)?);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_applies_all_then_nothing() {
        let db = Database::in_memory("test").await.unwrap();
        let runner = MigrationRunner::default();

        assert_eq!(runner.current_version(&db).await.unwrap(), None);

        let applied = runner.run(&db).await.unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(runner.current_version(&db).await.unwrap(), Some(3));

        let applied = runner.run(&db).await.unwrap();
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn test_tables_exist_after_migration() {
        let db = Database::in_memory("test").await.unwrap();
        MigrationRunner::default().run(&db).await.unwrap();

        let conn = db.connection().await.unwrap();
        for table in ["users", "public_keys", "chat_requests", "messages"] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                    [table],
                )
                .await
                .unwrap();
            assert!(rows.next().await.unwrap().is_some(), "missing table {table}");
        }
    }
}
