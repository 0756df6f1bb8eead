use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use messaging_core::prelude::{Delivery, MessageBroker, MessageProperties, MessagingError};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

const CONSUMER_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    properties: MessageProperties,
    body: String,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    dead_letter_exchange: Option<String>,
    buffer: VecDeque<QueuedMessage>,
    consumer: Option<mpsc::Sender<Delivery>>,
}

struct PendingDelivery {
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, PendingDelivery>,
    next_tag: u64,
}

/// Topic-exchange broker living entirely in process memory.
///
/// Routing keys match bindings segment-wise: `*` matches exactly one
/// segment, `#` matches anything. A publish that reaches no queue is
/// rejected, mirroring a mandatory publish against a topic exchange.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sitting in the queue buffer (not yet handed to a consumer).
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.buffer.len())
    }

    /// Drops an exchange, making subsequent publishes to it fail.
    pub async fn delete_exchange(&self, exchange: &str) {
        let mut state = self.state.lock().await;
        state.exchanges.remove(exchange);
    }
}

fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    if pattern_parts.len() != key_parts.len() {
        return false;
    }
    pattern_parts
        .iter()
        .zip(&key_parts)
        .all(|(p, k)| *p == "*" || p == k)
}

impl BrokerState {
    /// Hands the message to the queue's consumer, or buffers it. Delivered
    /// messages are tracked until acked or nacked.
    fn enqueue(&mut self, queue_name: &str, message: QueuedMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        if let Some(sender) = &queue.consumer {
            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery {
                tag,
                properties: message.properties.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            match sender.try_send(delivery) {
                Ok(()) => {
                    self.unacked.insert(
                        tag,
                        PendingDelivery { queue: queue_name.to_string(), message },
                    );
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    queue.consumer = None;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(queue = queue_name, "consumer channel full, buffering");
                }
            }
        }
        // Reborrow after the consumer handling above.
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.buffer.push_back(message);
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: QueuedMessage) -> usize {
        let Some(bindings) = self.exchanges.get(exchange) else {
            return 0;
        };
        let targets: Vec<String> = bindings
            .iter()
            .filter(|b| pattern_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        for queue in &targets {
            self.enqueue(queue, message.clone());
        }
        targets.len()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_insert(QueueState {
            dead_letter_exchange: None,
            buffer: VecDeque::new(),
            consumer: None,
        });
        Ok(())
    }

    async fn declare_quorum_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_insert(QueueState {
            dead_letter_exchange: Some(dead_letter_exchange.to_string()),
            buffer: VecDeque::new(),
            consumer: None,
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Infrastructure(format!(
                "bind to undeclared queue '{queue}'"
            )));
        }
        let Some(bindings) = state.exchanges.get_mut(exchange) else {
            return Err(MessagingError::Infrastructure(format!(
                "bind to undeclared exchange '{exchange}'"
            )));
        };
        bindings.push(Binding {
            queue: queue.to_string(),
            pattern: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::MessageNotPublished(format!(
                "exchange '{exchange}' does not exist"
            )));
        }
        let message = QueuedMessage {
            properties,
            body: body.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        let routed = state.route(exchange, routing_key, message);
        if routed == 0 {
            return Err(MessagingError::MessageNotPublished(format!(
                "routing key '{routing_key}' is unroutable on '{exchange}'"
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, MessagingError> {
        let mut state = self.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(MessagingError::Infrastructure(format!(
                "consume from undeclared queue '{queue}'"
            )));
        };
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);
        q.consumer = Some(tx);
        let buffered: Vec<QueuedMessage> = q.buffer.drain(..).collect();
        for message in buffered {
            state.enqueue(queue, message);
        }
        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        state.unacked.remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.unacked.remove(&tag) else {
            return Ok(());
        };
        if requeue {
            let mut message = pending.message;
            message.redelivered = true;
            state.enqueue(&pending.queue, message);
            return Ok(());
        }
        let dlx = state
            .queues
            .get(&pending.queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        match dlx {
            Some(exchange) => {
                let routing_key = pending.message.routing_key.clone();
                state.route(&exchange, &routing_key, pending.message);
            }
            None => {
                warn!(queue = %pending.queue, "rejected message dropped (no DLX)");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(pattern_matches("orders.OrderPlaced", "orders.OrderPlaced"));
        assert!(pattern_matches("orders.*", "orders.OrderPlaced"));
        assert!(pattern_matches("#", "orders.OrderPlaced"));
        assert!(!pattern_matches("orders.*", "payments.Charged"));
        assert!(!pattern_matches("orders.*", "orders.sub.Deep"));
        assert!(!pattern_matches("orders.OrderPlaced", "orders.OrderShipped"));
    }

    fn properties(id: &str) -> MessageProperties {
        MessageProperties {
            message_id: id.to_string(),
            event_type: "OrderPlaced".to_string(),
            content_type: "application/json".to_string(),
            app_id: "orders".to_string(),
            persistent: true,
        }
    }

    #[tokio::test]
    async fn publish_without_matching_binding_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("x").await.unwrap();
        let result = broker.publish("x", "orders.OrderPlaced", properties("1"), "{}").await;
        assert!(matches!(result, Err(MessagingError::MessageNotPublished(_))));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_with_flag() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("x").await.unwrap();
        broker.declare_queue("q").await.unwrap();
        broker.bind_queue("q", "x", "orders.*").await.unwrap();

        let mut rx = broker.consume("q").await.unwrap();
        broker
            .publish("x", "orders.OrderPlaced", properties("1"), "{}")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(!first.redelivered);
        broker.nack(first.tag, true).await.unwrap();

        let second = rx.recv().await.unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, first.body);
        broker.ack(second.tag).await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("dlx").await.unwrap();
        broker.declare_queue("dlq").await.unwrap();
        broker.bind_queue("dlq", "dlx", "#").await.unwrap();
        broker.declare_exchange("x").await.unwrap();
        broker.declare_quorum_queue("q", "dlx").await.unwrap();
        broker.bind_queue("q", "x", "orders.*").await.unwrap();

        let mut rx = broker.consume("q").await.unwrap();
        broker
            .publish("x", "orders.OrderPlaced", properties("1"), "{}")
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        broker.nack(delivery.tag, false).await.unwrap();

        assert_eq!(broker.queue_len("dlq").await, 1);
        assert_eq!(broker.queue_len("q").await, 0);
    }

    #[tokio::test]
    async fn consume_drains_previously_buffered_messages() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("x").await.unwrap();
        broker.declare_queue("q").await.unwrap();
        broker.bind_queue("q", "x", "orders.*").await.unwrap();
        broker
            .publish("x", "orders.OrderPlaced", properties("1"), "{}")
            .await
            .unwrap();
        assert_eq!(broker.queue_len("q").await, 1);

        let mut rx = broker.consume("q").await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.properties.message_id, "1");
    }
}
