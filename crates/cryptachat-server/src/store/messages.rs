//! The durable message log.

use cryptachat_relay::{MessageLog, MessageRecord, NewMessage, StoredMessage, UserId};
use tracing::{debug, instrument};

use super::{now_timestamp, parse_timestamp, StoreError};
use crate::db::Database;

/// Append-only message log backed by the `messages` table.
#[derive(Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(sender = message.sender_id, recipient = message.recipient_id))]
    async fn insert(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let conn = self.db.connection().await?;
        let (timestamp, timestamp_text) = now_timestamp();

        let mut rows = conn
            .query(
                r#"
                INSERT INTO messages (sender_id, recipient_id, sender_blob, recipient_blob, timestamp)
                VALUES (?, ?, ?, ?, ?)
                RETURNING id
                "#,
                (
                    message.sender_id,
                    message.recipient_id,
                    message.sender_blob.as_str(),
                    message.recipient_blob.as_str(),
                    timestamp_text,
                ),
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::Corrupt("insert returned no id".to_string()))?;
        let id: i64 = row.get(0)?;
        debug!(message_id = id, "Message appended");

        Ok(StoredMessage {
            id,
            sender_id: message.sender_id,
            sender_username: message.sender_username,
            recipient_id: message.recipient_id,
            sender_blob: message.sender_blob,
            recipient_blob: message.recipient_blob,
            timestamp,
        })
    }

    async fn conversation(
        &self,
        viewer: UserId,
        partner: UserId,
        since_id: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT
                    m.id,
                    m.sender_id,
                    m.recipient_id,
                    m.timestamp,
                    sender.username,
                    CASE WHEN m.sender_id = ?1 THEN m.sender_blob ELSE m.recipient_blob END
                FROM messages m
                JOIN users sender ON sender.id = m.sender_id
                WHERE ((m.sender_id = ?1 AND m.recipient_id = ?2)
                    OR (m.sender_id = ?2 AND m.recipient_id = ?1))
                  AND m.id > ?3
                ORDER BY m.timestamp ASC, m.id ASC
                "#,
                (viewer, partner, since_id),
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            let timestamp: String = row.get(3)?;
            messages.push(MessageRecord {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                recipient_id: row.get(2)?,
                timestamp: parse_timestamp(&timestamp)?,
                sender_username: row.get(4)?,
                encrypted_blob: row.get(5)?,
            });
        }
        Ok(messages)
    }
}

impl MessageLog for MessageStore {
    type Error = StoreError;

    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        self.insert(message).await
    }

    async fn query(
        &self,
        viewer: UserId,
        partner: UserId,
        since_id: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.conversation(viewer, partner, since_id).await
    }
}
