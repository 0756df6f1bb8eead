use std::sync::Arc;

use tokio::sync::watch::Receiver;
use tracing::{debug, error, info};

use crate::broker::{MessageBroker, MessageProperties};
use crate::config::ProcessorConfig;
use crate::error::MessagingError;
use crate::storage::OutboxStorage;
use crate::topology::Topology;

/// Background loop that drains the outbox into the broker.
///
/// Each tick reads the unsent rows in insertion order and publishes them one
/// by one, marking each row sent immediately so partial progress survives a
/// later failure. A rejected publish aborts the whole tick: the remainder
/// stays unsent and is retried on the next interval rather than hammered
/// message-by-message against a broken topology.
pub struct PublishProcessor<S, B> {
    storage: Arc<S>,
    broker: Arc<B>,
    topology: Arc<Topology>,
    config: ProcessorConfig,
    shutdown_rx: Receiver<bool>,
}

impl<S, B> PublishProcessor<S, B>
where
    S: OutboxStorage + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(
        storage: Arc<S>,
        broker: Arc<B>,
        topology: Arc<Topology>,
        config: ProcessorConfig,
        shutdown_rx: Receiver<bool>,
    ) -> Self {
        Self { storage, broker, topology, config, shutdown_rx }
    }

    /// Runs until the shutdown channel flips to `true`.
    pub async fn run(mut self) -> Result<(), MessagingError> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        info!("publish processor started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.process_once().await {
                        Ok(0) => {}
                        Ok(count) => debug!("published {} messages", count),
                        Err(e) => error!("publishing processor error: {}", e),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("publish processor stopped");
        Ok(())
    }

    /// One poll iteration. Returns how many messages were published.
    ///
    /// # Errors
    ///
    /// Storage errors from the poll or the mark-sent update, and
    /// [`MessagingError::MessageNotPublished`] when the broker rejected a
    /// message; in every case the remaining unsent rows are left for the
    /// next iteration.
    pub async fn process_once(&self) -> Result<usize, MessagingError> {
        let messages = self.storage.select_unsent().await?;
        let mut published = 0usize;

        for message in messages {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let exchange = self
                .topology
                .exchange_for(&message.topic)
                .ok_or_else(|| {
                    MessagingError::MessageNotPublished(format!(
                        "no exchange for topic '{}'",
                        message.topic
                    ))
                })?;

            let id = message.message_id;
            self.broker
                .publish(
                    exchange,
                    &message.routing_key(),
                    MessageProperties::for_outbox(&message),
                    &message.body,
                )
                .await?;
            self.storage.mark_as_sent(&[id]).await?;
            published += 1;
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockMessageBroker;
    use crate::config::MessagingConfig;
    use crate::model::OutboxMessage;
    use crate::object::{EventType, Payload, Topic};
    use crate::registry::{DomainEvent, EventRegistry};
    use crate::storage::MockOutboxStorage;
    use crate::topology::TopologyConfigurator;
    use mockall::Sequence;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::watch;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl DomainEvent for OrderPlaced {
        const TOPIC: &'static str = "orders";
        const NAME: &'static str = "OrderPlaced";
    }

    fn topology() -> Arc<Topology> {
        let registry = Arc::new(
            EventRegistry::builder().event::<OrderPlaced>().build().unwrap(),
        );
        let config = MessagingConfig::new().topic("orders");
        Arc::new(TopologyConfigurator::new(registry, config).build().unwrap())
    }

    fn outbox_message(n: u64) -> OutboxMessage {
        OutboxMessage::new(
            Topic::new("orders"),
            EventType::new("OrderPlaced"),
            &Payload::new(json!({ "order_id": n })),
        )
    }

    #[tokio::test]
    async fn publishes_each_message_and_marks_sent_immediately() {
        let first = outbox_message(1);
        let second = outbox_message(2);
        let first_id = first.message_id;
        let second_id = second.message_id;

        let mut storage = MockOutboxStorage::new();
        let mut broker = MockMessageBroker::new();
        let mut seq = Sequence::new();

        let batch = vec![first, second];
        storage
            .expect_select_unsent()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move || Ok(batch));
        broker
            .expect_publish()
            .withf(|exchange, key, props, _| {
                exchange == "winter.orders_events_topic"
                    && key == "orders.OrderPlaced"
                    && props.persistent
                    && props.content_type == "application/json"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        storage
            .expect_mark_as_sent()
            .withf(move |ids| ids.len() == 1 && ids[0] == first_id)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        storage
            .expect_mark_as_sent()
            .withf(move |ids| ids.len() == 1 && ids[0] == second_id)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (_tx, rx) = watch::channel(false);
        let processor = PublishProcessor::new(
            Arc::new(storage),
            Arc::new(broker),
            topology(),
            ProcessorConfig::default(),
            rx,
        );
        assert_eq!(processor.process_once().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_publish_aborts_the_iteration() {
        let first = outbox_message(1);
        let second = outbox_message(2);

        let mut storage = MockOutboxStorage::new();
        let mut broker = MockMessageBroker::new();

        let batch = vec![first, second];
        storage.expect_select_unsent().return_once(move || Ok(batch));
        // The first publish is rejected; the second must never be attempted
        // and nothing is marked sent.
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| {
                Err(MessagingError::MessageNotPublished("unroutable".to_string()))
            });
        storage.expect_mark_as_sent().times(0);

        let (_tx, rx) = watch::channel(false);
        let processor = PublishProcessor::new(
            Arc::new(storage),
            Arc::new(broker),
            topology(),
            ProcessorConfig::default(),
            rx,
        );
        let result = processor.process_once().await;
        assert!(matches!(result, Err(MessagingError::MessageNotPublished(_))));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let mut storage = MockOutboxStorage::new();
        storage.expect_select_unsent().returning(|| Ok(vec![]));
        let broker = MockMessageBroker::new();

        let (tx, rx) = watch::channel(false);
        let processor = PublishProcessor::new(
            Arc::new(storage),
            Arc::new(broker),
            topology(),
            ProcessorConfig::default(),
            rx,
        );
        let handle = tokio::spawn(processor.run());
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("processor did not stop in time")
            .unwrap()
            .unwrap();
    }
}
