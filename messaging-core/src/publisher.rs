use std::sync::Arc;

use tracing::debug;

use crate::error::MessagingError;
use crate::model::OutboxMessage;
use crate::object::{EventType, MessageId, Payload};
use crate::registry::{DomainEvent, EventRegistry};
use crate::storage::OutboxStorage;

/// Producer-side entry point: records the intent to publish in the outbox.
///
/// `emit` must run inside the same database transaction as the business
/// change it reports; the publisher never talks to the broker itself, which
/// is what keeps the domain state and the outbox row atomic without a
/// two-phase commit.
pub struct EventPublisher<W> {
    writer: Arc<W>,
    registry: Arc<EventRegistry>,
}

impl<W> EventPublisher<W>
where
    W: OutboxStorage,
{
    pub fn new(writer: Arc<W>, registry: Arc<EventRegistry>) -> Self {
        Self { writer, registry }
    }

    /// Serializes the event, resolves its topic and persists an outbox row
    /// with a fresh message id.
    ///
    /// # Errors
    ///
    /// [`MessagingError::UnknownEventType`] when the event was never
    /// registered, [`MessagingError::Serialization`] when the payload does
    /// not encode, or a storage error from the insert.
    pub async fn emit<E: DomainEvent>(&self, event: &E) -> Result<MessageId, MessagingError> {
        let name = EventType::new(E::NAME);
        let topic = self
            .registry
            .topic_of(&name)
            .cloned()
            .ok_or_else(|| MessagingError::UnknownEventType(name.clone()))?;

        let payload = Payload::new(serde_json::to_value(event)?);
        let message = OutboxMessage::new(topic, name, &payload);
        let id = message.message_id;

        self.writer.save(message).await?;
        debug!(message_id = %id, event_type = E::NAME, "outbox row saved");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DomainEvent;
    use crate::storage::MockOutboxStorage;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct SampleEvent {
        id: u64,
        payload: String,
    }

    impl DomainEvent for SampleEvent {
        const TOPIC: &'static str = "sample-topic";
        const NAME: &'static str = "SampleEvent";
    }

    fn registry() -> Arc<EventRegistry> {
        Arc::new(
            EventRegistry::builder()
                .event::<SampleEvent>()
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn emit_saves_serialized_row_with_resolved_topic() {
        let mut writer = MockOutboxStorage::new();
        writer
            .expect_save()
            .withf(|m| {
                m.topic.as_str() == "sample-topic"
                    && m.event_type.as_str() == "SampleEvent"
                    && m.published_at.is_none()
                    && serde_json::from_str::<serde_json::Value>(&m.body).unwrap()["id"] == 1
            })
            .times(1)
            .returning(|_| Ok(()));

        let publisher = EventPublisher::new(Arc::new(writer), registry());
        let event = SampleEvent { id: 1, payload: "p".into() };
        publisher.emit(&event).await.unwrap();
    }

    #[tokio::test]
    async fn emit_rejects_unregistered_event_type() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Stranger;
        impl DomainEvent for Stranger {
            const TOPIC: &'static str = "nowhere";
            const NAME: &'static str = "Stranger";
        }

        let publisher = EventPublisher::new(Arc::new(MockOutboxStorage::new()), registry());
        let result = publisher.emit(&Stranger).await;
        assert!(matches!(result, Err(MessagingError::UnknownEventType(_))));
    }
}
