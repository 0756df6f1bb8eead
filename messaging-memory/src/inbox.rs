use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use messaging_core::prelude::{ConsumerId, InboxRecord, InboxStorage, MessageId, MessagingError};
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Inbox table in memory, keyed by `(message_id, consumer_id)`.
#[derive(Default)]
pub struct InMemoryInboxStorage {
    rows: Mutex<HashMap<(MessageId, ConsumerId), InboxRecord>>,
}

impl InMemoryInboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &MessageId, consumer: &ConsumerId) -> Option<InboxRecord> {
        let rows = self.rows.lock().await;
        rows.get(&(*id, consumer.clone())).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl InboxStorage for InMemoryInboxStorage {
    async fn upsert(&self, record: InboxRecord) -> Result<InboxRecord, MessagingError> {
        let mut rows = self.rows.lock().await;
        let key = (record.message_id, record.consumer_id.clone());
        let stored = rows
            .entry(key)
            .and_modify(|existing| existing.counter += 1)
            .or_insert(record);
        Ok(stored.clone())
    }

    async fn mark_as_processed(
        &self,
        message_id: &MessageId,
        consumer_id: &ConsumerId,
    ) -> Result<(), MessagingError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&(*message_id, consumer_id.clone())) {
            Some(record) => {
                if record.processed_at.is_none() {
                    record.processed_at = Some(OffsetDateTime::now_utc());
                }
                Ok(())
            }
            None => Err(MessagingError::Infrastructure(format!(
                "no inbox row for message {message_id} and consumer {consumer_id}"
            ))),
        }
    }

    async fn remove_processed(&self, retention: Duration) -> Result<u64, MessagingError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, record| match record.processed_at {
            Some(processed_at) => processed_at > cutoff,
            None => true,
        });
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging_core::prelude::EventType;

    fn record(id: MessageId) -> InboxRecord {
        InboxRecord::new(id, ConsumerId::new("billing"), EventType::new("OrderPlaced"))
    }

    #[tokio::test]
    async fn upsert_increments_counter_on_conflict() {
        let storage = InMemoryInboxStorage::new();
        let id = MessageId::default();

        let first = storage.upsert(record(id)).await.unwrap();
        assert_eq!(first.counter, 0);

        let second = storage.upsert(record(id)).await.unwrap();
        assert_eq!(second.counter, 1);

        let third = storage.upsert(record(id)).await.unwrap();
        assert_eq!(third.counter, 2);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn upsert_returns_the_stored_processed_mark() {
        let storage = InMemoryInboxStorage::new();
        let id = MessageId::default();
        let consumer = ConsumerId::new("billing");

        storage.upsert(record(id)).await.unwrap();
        storage.mark_as_processed(&id, &consumer).await.unwrap();

        let redelivered = storage.upsert(record(id)).await.unwrap();
        assert!(redelivered.is_processed());
    }

    #[tokio::test]
    async fn consumers_are_deduplicated_independently() {
        let storage = InMemoryInboxStorage::new();
        let id = MessageId::default();
        let other = InboxRecord::new(id, ConsumerId::new("audit"), EventType::new("OrderPlaced"));

        storage.upsert(record(id)).await.unwrap();
        let audit_row = storage.upsert(other).await.unwrap();
        assert_eq!(audit_row.counter, 0);
        assert_eq!(storage.len().await, 2);
    }

    #[tokio::test]
    async fn remove_processed_keeps_unprocessed_rows() {
        let storage = InMemoryInboxStorage::new();
        let processed = MessageId::default();
        let pending = MessageId::default();
        let consumer = ConsumerId::new("billing");

        storage.upsert(record(processed)).await.unwrap();
        storage.upsert(record(pending)).await.unwrap();
        storage.mark_as_processed(&processed, &consumer).await.unwrap();

        assert_eq!(storage.remove_processed(Duration::ZERO).await.unwrap(), 1);
        assert!(storage.get(&pending, &consumer).await.is_some());
    }
}
