//! Seam between the durable message log and live push.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::frame::{MessageRecord, NewMessage, OutboundFrame, StoredMessage, UserId};
use crate::hub::HubHandle;

/// Durable, append-only message storage.
///
/// Implemented by the server's database layer; the relay only needs these
/// two operations.
pub trait MessageLog: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a message, returning it with its assigned id and timestamp.
    fn append(
        &self,
        message: NewMessage,
    ) -> impl Future<Output = Result<StoredMessage, Self::Error>> + Send;

    /// Messages exchanged between `viewer` and `partner` with an id greater
    /// than `since_id`, oldest first, each projected onto `viewer`'s view.
    fn query(
        &self,
        viewer: UserId,
        partner: UserId,
        since_id: i64,
    ) -> impl Future<Output = Result<Vec<MessageRecord>, Self::Error>> + Send;
}

/// Persists messages and then notifies their recipients.
pub struct DeliveryGateway<L> {
    log: Arc<L>,
    hub: HubHandle,
}

impl<L> Clone for DeliveryGateway<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            hub: self.hub.clone(),
        }
    }
}

impl<L: MessageLog> DeliveryGateway<L> {
    pub fn new(log: Arc<L>, hub: HubHandle) -> Self {
        Self { log, hub }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Store a message, then push it to the recipient if they are online.
    ///
    /// Only a storage failure is returned. The push is best effort and its
    /// payload is built from the stored record, so anything a client
    /// receives live can also be fetched with [`DeliveryGateway::history`].
    #[instrument(skip(self, message), fields(sender = message.sender_id, recipient = message.recipient_id))]
    pub async fn send(&self, message: NewMessage) -> Result<StoredMessage, L::Error> {
        let stored = self.log.append(message).await?;
        debug!(message_id = stored.id, "Message stored, notifying recipient");

        self.notify(
            stored.recipient_id,
            OutboundFrame::Message(stored.view_for(stored.recipient_id)),
        );
        Ok(stored)
    }

    /// Fire-and-forget push of any frame to `recipient`.
    pub fn notify(&self, recipient: UserId, frame: impl Into<OutboundFrame>) {
        self.hub.submit(recipient, frame);
    }

    /// Poll the log for a conversation.
    pub async fn history(
        &self,
        viewer: UserId,
        partner: UserId,
        since_id: i64,
    ) -> Result<Vec<MessageRecord>, L::Error> {
        self.log.query(viewer, partner, since_id).await
    }
}
