use cryptachat_relay::UserId;
use tracing::{debug, instrument};

use super::{is_unique_violation, now_timestamp, StoreError};
use crate::db::Database;

/// Account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
}

#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create an account. Fails with [`StoreError::UsernameTaken`] on a duplicate name.
    #[instrument(skip(self, password_hash))]
    pub async fn create(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError> {
        let conn = self.db.connection().await?;
        let (_, created_at) = now_timestamp();

        let taken = |e: libsql::Error| {
            if is_unique_violation(&e) {
                StoreError::UsernameTaken
            } else {
                StoreError::from(e)
            }
        };

        // The constraint fires when the RETURNING row is stepped, not at prepare.
        let mut rows = conn
            .query(
                "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?) RETURNING id",
                (username, password_hash, created_at),
            )
            .await
            .map_err(taken)?;
        let row = rows
            .next()
            .await
            .map_err(taken)?
            .ok_or_else(|| StoreError::Corrupt("insert returned no id".to_string()))?;
        let id: UserId = row.get(0)?;
        debug!(user_id = id, "User created");
        Ok(id)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, username, password_hash FROM users WHERE username = ?",
                [username],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(User {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, username, password_hash FROM users WHERE id = ?",
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(User {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    /// Resolve a username to its id.
    pub async fn id_of(&self, username: &str) -> Result<UserId, StoreError> {
        self.find_by_username(username)
            .await?
            .map(|user| user.id)
            .ok_or(StoreError::UserNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::migrated_db;

    #[tokio::test]
    async fn test_create_and_find() {
        let store = UserStore::new(migrated_db().await);

        let id = store.create("alice", "hash").await.unwrap();
        let by_name = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_name.password_hash, "hash");

        let by_id = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
        assert_eq!(store.id_of("alice").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let store = UserStore::new(migrated_db().await);
        store.create("bob", "hash").await.unwrap();

        let err = store.create("bob", "other").await.unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let store = UserStore::new(migrated_db().await);
        assert!(store.find_by_username("ghost").await.unwrap().is_none());
        assert!(store.find_by_id(99).await.unwrap().is_none());
        assert!(matches!(
            store.id_of("ghost").await,
            Err(StoreError::UserNotFound)
        ));
    }
}
