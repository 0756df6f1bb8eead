use crate::object::{ConsumerId, EventType, MessageId, Payload, Topic};
use time::OffsetDateTime;

/// A message awaiting publication, written in the same transaction as the
/// business change it reports.
///
/// `published_at` is null until the publish processor hands the message to
/// the broker; it transitions to non-null exactly once, after which the row
/// is immutable and a cleanup candidate.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OutboxMessage {
    pub message_id: MessageId,
    pub topic: Topic,
    pub event_type: EventType,
    pub body: String,
    pub created_at: OffsetDateTime,
    pub published_at: Option<OffsetDateTime>,
}

impl OutboxMessage {
    pub fn new(topic: Topic, event_type: EventType, payload: &Payload) -> Self {
        Self {
            message_id: MessageId::default(),
            topic,
            event_type,
            body: payload.to_body(),
            created_at: OffsetDateTime::now_utc(),
            published_at: None,
        }
    }

    /// Routing key on the wire: `<topic>.<EventName>`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.topic, self.event_type)
    }
}

/// Receipt record for one delivery of a message to one consumer group.
///
/// `(message_id, consumer_id)` is the unique key; `counter` grows by one on
/// every redelivery through the upsert conflict path. `processed_at` is set
/// exactly once, when the handlers complete.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InboxRecord {
    pub message_id: MessageId,
    pub consumer_id: ConsumerId,
    pub name: EventType,
    pub counter: i32,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

impl InboxRecord {
    pub fn new(message_id: MessageId, consumer_id: ConsumerId, name: EventType) -> Self {
        Self {
            message_id,
            consumer_id,
            name,
            counter: 0,
            received_at: OffsetDateTime::now_utc(),
            processed_at: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}
