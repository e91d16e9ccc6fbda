//! Chat requests and accepted contacts.
//!
//! A request is a directed row `(requester, requested)` that starts as
//! `pending` and becomes `accepted` when the requested user agrees. Contacts
//! are accepted requests in either direction.

use cryptachat_relay::UserId;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{is_unique_violation, now_timestamp, StoreError};
use crate::db::Database;

/// A pending request as shown to the requested user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub requester_username: String,
    pub status: String,
}

#[derive(Clone)]
pub struct ContactStore {
    db: Database,
}

impl ContactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a pending request from `requester_id` to `requested_id`.
    #[instrument(skip(self))]
    pub async fn request(&self, requester_id: UserId, requested_id: UserId) -> Result<(), StoreError> {
        if requester_id == requested_id {
            return Err(StoreError::SelfRequest);
        }

        let conn = self.db.connection().await?;
        let (_, created_at) = now_timestamp();
        conn.execute(
            "INSERT INTO chat_requests (requester_id, requested_id, status, created_at) VALUES (?, ?, 'pending', ?)",
            (requester_id, requested_id, created_at),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateRequest
            } else {
                StoreError::from(e)
            }
        })?;

        debug!("Chat request recorded");
        Ok(())
    }

    /// Requests still waiting on `requested_id`, oldest first.
    pub async fn pending_for(&self, requested_id: UserId) -> Result<Vec<PendingRequest>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT u.username, cr.status
                FROM chat_requests cr
                JOIN users u ON u.id = cr.requester_id
                WHERE cr.requested_id = ? AND cr.status = 'pending'
                ORDER BY cr.id
                "#,
                [requested_id],
            )
            .await?;

        let mut requests = Vec::new();
        while let Some(row) = rows.next().await? {
            requests.push(PendingRequest {
                requester_username: row.get(0)?,
                status: row.get(1)?,
            });
        }
        Ok(requests)
    }

    /// Accept the pending request from `requester_id` to `requested_id`.
    #[instrument(skip(self))]
    pub async fn accept(&self, requested_id: UserId, requester_id: UserId) -> Result<(), StoreError> {
        let conn = self.db.connection().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE chat_requests
                SET status = 'accepted'
                WHERE requester_id = ? AND requested_id = ? AND status = 'pending'
                "#,
                (requester_id, requested_id),
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::NoPendingRequest);
        }
        debug!("Chat request accepted");
        Ok(())
    }

    /// Usernames of everyone `user_id` has an accepted request with, sorted.
    pub async fn contacts_of(&self, user_id: UserId) -> Result<Vec<String>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT u.username
                FROM chat_requests cr
                JOIN users u ON u.id = cr.requested_id
                WHERE cr.requester_id = ?1 AND cr.status = 'accepted'
                UNION
                SELECT u.username
                FROM chat_requests cr
                JOIN users u ON u.id = cr.requester_id
                WHERE cr.requested_id = ?1 AND cr.status = 'accepted'
                ORDER BY 1
                "#,
                [user_id],
            )
            .await?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await? {
            contacts.push(row.get(0)?);
        }
        Ok(contacts)
    }
}
