use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MessagingError;
use crate::model::OutboxMessage;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Broker message properties carried alongside the body.
#[derive(Debug, Clone)]
pub struct MessageProperties {
    pub message_id: String,
    pub event_type: String,
    pub content_type: String,
    pub app_id: String,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn for_outbox(message: &OutboxMessage) -> Self {
        Self {
            message_id: message.message_id.to_string(),
            event_type: message.event_type.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            app_id: message.topic.to_string(),
            persistent: true,
        }
    }
}

/// One message handed to a consumer. `tag` is the broker's delivery tag,
/// used for the manual ack/nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub properties: MessageProperties,
    pub body: String,
    pub redelivered: bool,
}

/// Topic-exchange pub/sub service with manual acknowledgement, durable
/// queues and dead-lettering.
///
/// `publish` must return [`MessagingError::MessageNotPublished`] when the
/// broker refuses the message (unroutable, overflow), and
/// [`MessagingError::BrokerConnection`] when the connection is gone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declares a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), MessagingError>;

    /// Declares a plain durable queue (the dead-letter queue itself).
    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError>;

    /// Declares a durable quorum queue; `dead_letter_exchange` receives
    /// messages rejected without requeue.
    async fn declare_quorum_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &str,
    ) -> Result<(), MessagingError>;

    /// Starts consuming from `queue`. The receiver yields deliveries until
    /// the connection drops or the consumer is cancelled.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, MessagingError>;

    async fn ack(&self, tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), MessagingError>;
}
