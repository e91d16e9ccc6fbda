use cryptachat_relay::UserId;
use tracing::instrument;

use super::{now_timestamp, StoreError};
use crate::db::Database;

/// Public keys, at most one per user.
#[derive(Clone)]
pub struct KeyStore {
    db: Database,
}

impl KeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace `user_id`'s public key.
    #[instrument(skip(self, public_key))]
    pub async fn upload(&self, user_id: UserId, public_key: &str) -> Result<(), StoreError> {
        let conn = self.db.connection().await?;
        let (_, updated_at) = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO public_keys (user_id, public_key, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE
                SET public_key = excluded.public_key, updated_at = excluded.updated_at
            "#,
            (user_id, public_key, updated_at),
        )
        .await?;
        Ok(())
    }

    /// A user's public key, or `None` if the user is unknown or has none.
    pub async fn by_username(&self, username: &str) -> Result<Option<String>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT pk.public_key
                FROM public_keys pk
                JOIN users u ON u.id = pk.user_id
                WHERE u.username = ?
                "#,
                [username],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::migrated_db;
    use crate::store::UserStore;

    #[tokio::test]
    async fn test_upload_replaces_existing_key() {
        let db = migrated_db().await;
        let users = UserStore::new(db.clone());
        let keys = KeyStore::new(db);
        let id = users.create("alice", "hash").await.unwrap();

        keys.upload(id, "key-1").await.unwrap();
        keys.upload(id, "key-2").await.unwrap();

        assert_eq!(keys.by_username("alice").await.unwrap().as_deref(), Some("key-2"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let db = migrated_db().await;
        let users = UserStore::new(db.clone());
        let keys = KeyStore::new(db);
        users.create("bob", "hash").await.unwrap();

        assert!(keys.by_username("bob").await.unwrap().is_none());
        assert!(keys.by_username("nobody").await.unwrap().is_none());
    }
}
