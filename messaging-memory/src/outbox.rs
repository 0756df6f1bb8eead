use std::time::Duration;

use async_trait::async_trait;
use messaging_core::prelude::{MessageId, MessagingError, OutboxMessage, OutboxStorage};
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Outbox table in memory, preserving insertion order.
#[derive(Default)]
pub struct InMemoryOutboxStorage {
    rows: Mutex<Vec<OutboxMessage>>,
}

impl InMemoryOutboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &MessageId) -> Option<OutboxMessage> {
        let rows = self.rows.lock().await;
        rows.iter().find(|m| m.message_id == *id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    async fn save(&self, message: OutboxMessage) -> Result<(), MessagingError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|m| m.message_id == message.message_id) {
            return Err(MessagingError::DuplicateMessage(message.message_id));
        }
        rows.push(message);
        Ok(())
    }

    async fn select_unsent(&self) -> Result<Vec<OutboxMessage>, MessagingError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|m| m.published_at.is_none())
            .cloned()
            .collect())
    }

    async fn mark_as_sent(&self, ids: &[MessageId]) -> Result<(), MessagingError> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().await;
        for row in rows.iter_mut() {
            if ids.contains(&row.message_id) && row.published_at.is_none() {
                row.published_at = Some(now);
            }
        }
        Ok(())
    }

    async fn remove_sent(&self, retention: Duration) -> Result<u64, MessagingError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|m| match m.published_at {
            Some(published_at) => published_at > cutoff,
            None => true,
        });
        Ok((before - rows.len()) as u64)
    }
}
