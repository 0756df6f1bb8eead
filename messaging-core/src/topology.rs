use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use crate::broker::MessageBroker;
use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::object::{ConsumerId, Topic};
use crate::registry::EventRegistry;

pub const DEAD_LETTER_EXCHANGE: &str = "winter.dead_letter_exchange";
pub const DEAD_LETTER_QUEUE: &str = "winter.dead_letter_queue";

pub fn exchange_name(topic: &Topic) -> String {
    format!("winter.{topic}_events_topic")
}

pub fn queue_name(consumer: &ConsumerId) -> String {
    format!("winter.{consumer}_events_queue")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Broker object layout derived from the registry and the declared config.
/// Read-only after construction.
#[derive(Debug, Clone)]
pub struct Topology {
    exchanges: BTreeMap<Topic, String>,
    queues: BTreeMap<ConsumerId, String>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn exchange_for(&self, topic: &Topic) -> Option<&str> {
        self.exchanges.get(topic).map(String::as_str)
    }

    pub fn queue_for(&self, consumer: &ConsumerId) -> Option<&str> {
        self.queues.get(consumer).map(String::as_str)
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Declares the layout on the broker: dead-letter pair first, then one
    /// durable topic exchange per topic, one quorum queue per consumer
    /// (dead-lettered to the DLX), then every binding. Any failure
    /// propagates immediately; a partial topology must never run.
    pub async fn declare<B: MessageBroker>(&self, broker: &B) -> Result<(), MessagingError> {
        broker.declare_exchange(DEAD_LETTER_EXCHANGE).await?;
        broker.declare_queue(DEAD_LETTER_QUEUE).await?;
        broker
            .bind_queue(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, "#")
            .await?;

        for exchange in self.exchanges.values() {
            broker.declare_exchange(exchange).await?;
        }
        for queue in self.queues.values() {
            broker
                .declare_quorum_queue(queue, DEAD_LETTER_EXCHANGE)
                .await?;
        }
        for binding in &self.bindings {
            broker
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }
        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology declared"
        );
        Ok(())
    }
}

/// Cross-checks the declared config against the registry and derives the
/// exchange/queue/binding layout.
pub struct TopologyConfigurator {
    registry: Arc<EventRegistry>,
    config: MessagingConfig,
}

impl TopologyConfigurator {
    pub fn new(registry: Arc<EventRegistry>, config: MessagingConfig) -> Self {
        Self { registry, config }
    }

    /// Validates and builds. No broker calls happen here; a mismatch is
    /// reported before anything is declared.
    ///
    /// # Errors
    ///
    /// [`MessagingError::InvalidTopology`] when the declared topic set
    /// differs from the registered one, when a consumer's declared topics
    /// differ from its registrations, when a consumer appears on only one
    /// side, or when an event carries an empty topic.
    pub fn build(&self) -> Result<Topology, MessagingError> {
        let discovered = self.registry.event_topics();
        if discovered.iter().any(Topic::is_empty) {
            return Err(MessagingError::InvalidTopology(
                "an event is registered with an empty topic".to_string(),
            ));
        }

        let declared: BTreeSet<Topic> =
            self.config.topics.iter().map(Topic::new).collect();
        if declared != discovered {
            return Err(MessagingError::InvalidTopology(format!(
                "declared topics {:?} do not match registered topics {:?}",
                names(&declared),
                names(&discovered),
            )));
        }

        let declared_consumers: BTreeSet<ConsumerId> =
            self.config.consumers.keys().map(ConsumerId::new).collect();
        let registered_consumers: BTreeSet<ConsumerId> =
            self.registry.consumers().cloned().collect();
        if declared_consumers != registered_consumers {
            return Err(MessagingError::InvalidTopology(format!(
                "declared consumers {:?} do not match registered consumers {:?}",
                declared_consumers, registered_consumers,
            )));
        }

        for (consumer_id, topics) in &self.config.consumers {
            let consumer = ConsumerId::new(consumer_id);
            let declared: BTreeSet<Topic> = topics.iter().map(Topic::new).collect();
            let registered = self.registry.consumer_topics(&consumer);
            if declared != registered {
                return Err(MessagingError::InvalidTopology(format!(
                    "consumer '{consumer_id}' declares topics {:?} but registers {:?}",
                    names(&declared),
                    names(&registered),
                )));
            }
        }

        let exchanges: BTreeMap<Topic, String> = discovered
            .iter()
            .map(|topic| (topic.clone(), exchange_name(topic)))
            .collect();
        let queues: BTreeMap<ConsumerId, String> = registered_consumers
            .iter()
            .map(|consumer| (consumer.clone(), queue_name(consumer)))
            .collect();

        let mut bindings = Vec::new();
        for consumer in &registered_consumers {
            let queue = queue_name(consumer);
            for key in self.registry.binding_keys(consumer) {
                // Binding keys are `<topic>.<suffix>`; the topic prefix
                // selects the exchange.
                let topic = Topic::new(key.split('.').next().unwrap_or_default());
                let Some(exchange) = exchanges.get(&topic) else {
                    return Err(MessagingError::InvalidTopology(format!(
                        "binding key '{key}' references unregistered topic '{topic}'"
                    )));
                };
                bindings.push(QueueBinding {
                    queue: queue.clone(),
                    exchange: exchange.clone(),
                    routing_key: key,
                });
            }
        }

        Ok(Topology { exchanges, queues, bindings })
    }
}

fn names(topics: &BTreeSet<Topic>) -> Vec<&str> {
    topics.iter().map(Topic::as_str).collect()
}
