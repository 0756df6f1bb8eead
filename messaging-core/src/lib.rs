//! Broker-backed, at-least-once event delivery built on the transactional
//! outbox and inbox patterns.
//!
//! Producers record events in an outbox table inside their own business
//! transaction; a background processor drains the table into a topic
//! exchange. Consumers deduplicate redeliveries through an inbox table
//! keyed by `(message_id, consumer_id)`, dispatch registered handlers
//! under a deadline, and escalate poisoned messages to a dead-letter
//! queue after a bounded number of retries.
//!
//! Storage and broker are seams ([`prelude::OutboxStorage`],
//! [`prelude::InboxStorage`], [`prelude::MessageBroker`]); adapter crates
//! supply the concrete backends.

mod broker;
mod cleanup;
mod config;
mod error;
mod listener;
mod model;
mod object;
mod processor;
mod publisher;
mod registry;
mod storage;
mod topology;
mod worker;

pub mod prelude {
    pub use crate::broker::{
        Delivery, MessageBroker, MessageProperties, CONTENT_TYPE_JSON,
    };
    pub use crate::cleanup::{InboxCleanup, OutboxCleanup};
    pub use crate::config::{ConsumerConfig, MessagingConfig, ProcessorConfig};
    pub use crate::error::MessagingError;
    pub use crate::listener::{ConsumeOutcome, ConsumerMiddleware, MessageListener};
    pub use crate::model::{InboxRecord, OutboxMessage};
    pub use crate::object::{ConsumerId, EventType, MessageId, Payload, Topic};
    pub use crate::processor::PublishProcessor;
    pub use crate::publisher::EventPublisher;
    pub use crate::registry::{
        DomainEvent, ErasedHandler, EventHandler, EventRegistry, EventRegistryBuilder,
    };
    pub use crate::storage::{InboxStorage, OutboxStorage};
    pub use crate::topology::{
        exchange_name, queue_name, QueueBinding, Topology, TopologyConfigurator,
        DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE,
    };
    pub use crate::worker::{shutdown_channel, spawn_signal_listener, ConsumerWorker};
}
