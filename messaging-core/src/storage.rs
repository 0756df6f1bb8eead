use std::time::Duration;

use async_trait::async_trait;

use crate::error::MessagingError;
use crate::model::{InboxRecord, OutboxMessage};
use crate::object::{ConsumerId, MessageId};

/// Durable table of messages awaiting publish.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Inserts a new row. Fails with [`MessagingError::DuplicateMessage`]
    /// when the message id is already present. Implementations bound to a
    /// caller transaction make the insert commit with the business change.
    async fn save(&self, message: OutboxMessage) -> Result<(), MessagingError>;

    /// All rows with `published_at` null, in insertion order.
    async fn select_unsent(&self) -> Result<Vec<OutboxMessage>, MessagingError>;

    /// Sets `published_at = now()` for the given ids.
    async fn mark_as_sent(&self, ids: &[MessageId]) -> Result<(), MessagingError>;

    /// Deletes published rows older than `retention`; returns the count.
    async fn remove_sent(&self, retention: Duration) -> Result<u64, MessagingError>;
}

/// Durable table of message receipts keyed by `(message_id, consumer_id)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboxStorage: Send + Sync {
    /// Insert-or-increment: a fresh record is stored as-is; on key conflict
    /// the stored row's counter is incremented. Returns the stored row, so
    /// the caller can short-circuit on an already-set `processed_at`.
    async fn upsert(&self, record: InboxRecord) -> Result<InboxRecord, MessagingError>;

    /// Sets `processed_at = now()`. Called after the handlers complete, in
    /// the same transactional scope as their business effects.
    async fn mark_as_processed(
        &self,
        message_id: &MessageId,
        consumer_id: &ConsumerId,
    ) -> Result<(), MessagingError>;

    /// Deletes processed rows older than `retention`; returns the count.
    async fn remove_processed(&self, retention: Duration) -> Result<u64, MessagingError>;
}
