use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MessagingError;
use crate::object::{ConsumerId, EventType, Topic};

/// An event that can travel through the outbox. The topic association is
/// part of the type, not of runtime configuration.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;
    const NAME: &'static str;
}

/// Business handler for one event type.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(&self, event: E) -> Result<(), MessagingError>;
}

/// Type-erased handler entry; deserialization happens once per dispatch,
/// dispatch resolution happens once at registry build time.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, body: &str) -> Result<(), MessagingError>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: DomainEvent,
    H: EventHandler<E>,
{
    async fn dispatch(&self, body: &str) -> Result<(), MessagingError> {
        let event: E = serde_json::from_str(body)?;
        self.handler.handle(event).await
    }
}

/// Lookup service mapping event type names to topics and to the handlers
/// each consumer group registered for them. Built once at startup,
/// read-only afterwards.
pub struct EventRegistry {
    topics: BTreeMap<EventType, Topic>,
    handlers: HashMap<(ConsumerId, EventType), Vec<Arc<dyn ErasedHandler>>>,
    topic_subscriptions: BTreeMap<ConsumerId, BTreeSet<Topic>>,
    consumers: BTreeSet<ConsumerId>,
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    pub fn topic_of(&self, name: &EventType) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn handlers_for(&self, consumer: &ConsumerId, name: &EventType) -> &[Arc<dyn ErasedHandler>] {
        self.handlers
            .get(&(consumer.clone(), name.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All topics that registered events belong to.
    pub fn event_topics(&self) -> BTreeSet<Topic> {
        self.topics.values().cloned().collect()
    }

    /// Topics a consumer group is attached to, via handlers or whole-topic
    /// subscriptions.
    pub fn consumer_topics(&self, consumer: &ConsumerId) -> BTreeSet<Topic> {
        let mut topics: BTreeSet<Topic> = self
            .handlers
            .keys()
            .filter(|(c, _)| c == consumer)
            .filter_map(|(_, name)| self.topics.get(name).cloned())
            .collect();
        if let Some(subscribed) = self.topic_subscriptions.get(consumer) {
            topics.extend(subscribed.iter().cloned());
        }
        topics
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerId> {
        self.consumers.iter()
    }

    /// Routing keys a consumer's queue must be bound with: one
    /// `<topic>.<EventName>` key per registered handler, plus a
    /// `<topic>.*` key per whole-topic subscription.
    pub fn binding_keys(&self, consumer: &ConsumerId) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for (c, name) in self.handlers.keys() {
            if c == consumer {
                if let Some(topic) = self.topics.get(name) {
                    keys.insert(format!("{topic}.{name}"));
                }
            }
        }
        if let Some(subscribed) = self.topic_subscriptions.get(consumer) {
            for topic in subscribed {
                keys.insert(format!("{topic}.*"));
            }
        }
        keys
    }
}

#[derive(Default)]
pub struct EventRegistryBuilder {
    topics: BTreeMap<EventType, Topic>,
    handlers: HashMap<(ConsumerId, EventType), Vec<Arc<dyn ErasedHandler>>>,
    topic_subscriptions: BTreeMap<ConsumerId, BTreeSet<Topic>>,
    consumers: BTreeSet<ConsumerId>,
    conflict: Option<EventType>,
}

impl EventRegistryBuilder {
    /// Register an event type for producers that never consume it.
    pub fn event<E: DomainEvent>(mut self) -> Self {
        self.record_event::<E>();
        self
    }

    /// Register a handler for `consumer_id`; implies event registration.
    pub fn handler<E, H>(mut self, consumer_id: &str, handler: H) -> Self
    where
        E: DomainEvent,
        H: EventHandler<E> + 'static,
    {
        self.record_event::<E>();
        let consumer = ConsumerId::new(consumer_id);
        self.consumers.insert(consumer.clone());
        self.handlers
            .entry((consumer, EventType::new(E::NAME)))
            .or_default()
            .push(Arc::new(TypedHandler { handler, _event: PhantomData }));
        self
    }

    /// Subscribe a consumer group to a whole topic family; its queue is
    /// bound with a `<topic>.*` wildcard key.
    pub fn subscribe_topic(mut self, consumer_id: &str, topic: &str) -> Self {
        let consumer = ConsumerId::new(consumer_id);
        self.consumers.insert(consumer.clone());
        self.topic_subscriptions
            .entry(consumer)
            .or_default()
            .insert(Topic::new(topic));
        self
    }

    fn record_event<E: DomainEvent>(&mut self) {
        let name = EventType::new(E::NAME);
        let topic = Topic::new(E::TOPIC);
        match self.topics.get(&name) {
            Some(existing) if existing != &topic => self.conflict = Some(name),
            _ => {
                self.topics.insert(name, topic);
            }
        }
    }

    pub fn build(self) -> Result<EventRegistry, MessagingError> {
        if let Some(name) = self.conflict {
            return Err(MessagingError::InvalidTopology(format!(
                "event type '{name}' registered under two different topics"
            )));
        }
        Ok(EventRegistry {
            topics: self.topics,
            handlers: self.handlers,
            topic_subscriptions: self.topic_subscriptions,
            consumers: self.consumers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl DomainEvent for OrderPlaced {
        const TOPIC: &'static str = "orders";
        const NAME: &'static str = "OrderPlaced";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: u64,
    }

    impl DomainEvent for OrderShipped {
        const TOPIC: &'static str = "orders";
        const NAME: &'static str = "OrderShipped";
    }

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler<OrderPlaced> for CountingHandler {
        async fn handle(&self, _event: OrderPlaced) -> Result<(), MessagingError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_decodes_body_and_invokes_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = EventRegistry::builder()
            .handler::<OrderPlaced, _>("billing", CountingHandler(calls.clone()))
            .build()
            .unwrap();

        let consumer = ConsumerId::new("billing");
        let name = EventType::new("OrderPlaced");
        let handlers = registry.handlers_for(&consumer, &name);
        assert_eq!(handlers.len(), 1);

        handlers[0].dispatch(r#"{"order_id": 7}"#).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn topic_lookup_and_binding_keys() {
        let registry = EventRegistry::builder()
            .event::<OrderShipped>()
            .handler::<OrderPlaced, _>("billing", CountingHandler(Arc::default()))
            .subscribe_topic("audit", "orders")
            .build()
            .unwrap();

        assert_eq!(
            registry.topic_of(&EventType::new("OrderPlaced")),
            Some(&Topic::new("orders"))
        );
        assert_eq!(
            registry.binding_keys(&ConsumerId::new("billing")),
            BTreeSet::from(["orders.OrderPlaced".to_string()])
        );
        assert_eq!(
            registry.binding_keys(&ConsumerId::new("audit")),
            BTreeSet::from(["orders.*".to_string()])
        );
        assert_eq!(registry.event_topics(), BTreeSet::from([Topic::new("orders")]));
    }

    #[test]
    fn conflicting_topic_registration_is_rejected() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Impostor;
        impl DomainEvent for Impostor {
            const TOPIC: &'static str = "payments";
            const NAME: &'static str = "OrderPlaced";
        }

        let result = EventRegistry::builder()
            .event::<OrderPlaced>()
            .event::<Impostor>()
            .build();
        assert!(matches!(result, Err(MessagingError::InvalidTopology(_))));
    }
}
