use std::time::Duration;

use thiserror::Error;

use crate::object::{EventType, MessageId};

#[derive(Debug, Error)]
pub enum MessagingError {
    /// Declared and registered topologies disagree. Fatal at startup.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The broker refused the publish (unroutable, queue overflow).
    #[error("Message was not published: {0}")]
    MessageNotPublished(String),

    /// The broker connection dropped; recoverable with backoff.
    #[error("Broker connection error: {0}")]
    BrokerConnection(String),

    /// A second outbox row with the same message id was saved.
    #[error("Duplicate message: {0}")]
    DuplicateMessage(MessageId),

    /// No topic or handler is registered for this event type name.
    #[error("Unknown event type: {0}")]
    UnknownEventType(EventType),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}
