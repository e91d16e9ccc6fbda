//! Persistence for accounts, keys, contacts and the message log.
//!
//! Each store is a cheap clone around the shared [`Database`] and owns the
//! SQL for one table family.

mod contacts;
mod keys;
mod messages;
mod users;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::db::DatabaseError;

pub use contacts::ContactStore;
pub use keys::KeyStore;
pub use messages::MessageStore;
pub use users::UserStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Username already exists")]
    UsernameTaken,

    #[error("User not found")]
    UserNotFound,

    #[error("Cannot send chat request to yourself")]
    SelfRequest,

    #[error("Chat request already pending or accepted")]
    DuplicateRequest,

    #[error("No pending request found from that user")]
    NoPendingRequest,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        StoreError::Database(DatabaseError::from(e))
    }
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort correctly.
fn now_timestamp() -> (DateTime<Utc>, String) {
    let now = Utc::now();
    // Round-trip through text so the returned value equals what a read would give.
    let text = now.to_rfc3339_opts(SecondsFormat::Micros, true);
    let parsed = parse_timestamp(&text).unwrap_or(now);
    (parsed, text)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {text:?}: {e}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::{Database, MigrationRunner};

    pub async fn migrated_db() -> Database {
        let db = Database::in_memory("test").await.unwrap();
        MigrationRunner::default().run(&db).await.unwrap();
        db
    }
}
