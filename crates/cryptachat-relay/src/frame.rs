//! Message records and the frames pushed to online clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verified user identity, as issued by the credential layer.
pub type UserId = i64;

/// A message as one participant sees it.
///
/// `encrypted_blob` is the ciphertext addressed to the viewer: the sender's
/// own copy when the viewer sent the message, the recipient's copy otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub sender_username: String,
    pub encrypted_blob: String,
}

/// A message about to be appended to the log.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub sender_username: String,
    pub recipient_id: UserId,
    /// Ciphertext encrypted to the sender's own key.
    pub sender_blob: String,
    /// Ciphertext encrypted to the recipient's key.
    pub recipient_blob: String,
}

/// A message as stored in the log, carrying both ciphertexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub sender_username: String,
    pub recipient_id: UserId,
    pub sender_blob: String,
    pub recipient_blob: String,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// Project the stored message onto one participant's view.
    pub fn view_for(&self, viewer: UserId) -> MessageRecord {
        let encrypted_blob = if viewer == self.sender_id {
            self.sender_blob.clone()
        } else {
            self.recipient_blob.clone()
        };

        MessageRecord {
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            timestamp: self.timestamp,
            sender_username: self.sender_username.clone(),
            encrypted_blob,
        }
    }
}

/// Everything the hub can push down a client's socket.
///
/// Serialized as one JSON object per frame with a `type` discriminator; the
/// `message` variant keeps the record's fields at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// A newly stored message addressed to the receiving user.
    Message(MessageRecord),
    /// Someone asked to open a conversation with the receiving user.
    ChatRequest { from_username: String },
    /// A chat request the receiving user sent was accepted.
    ChatAccepted { by_username: String },
}

impl OutboundFrame {
    /// Short name used in logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Message(_) => "message",
            OutboundFrame::ChatRequest { .. } => "chat_request",
            OutboundFrame::ChatAccepted { .. } => "chat_accepted",
        }
    }

    /// Encode the frame as the text payload of one WebSocket message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<MessageRecord> for OutboundFrame {
    fn from(record: MessageRecord) -> Self {
        OutboundFrame::Message(record)
    }
}
