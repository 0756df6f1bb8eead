use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use messaging_core::prelude::*;
use messaging_memory::{InMemoryBroker, InMemoryInboxStorage, InMemoryOutboxStorage};
use serde::{Deserialize, Serialize};
use tracing::{error, info, Level};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    payload: String,
}

impl DomainEvent for OrderCreated {
    const TOPIC: &'static str = "orders";
    const NAME: &'static str = "OrderCreated";
}

struct OrderProjection {
    orders: Arc<Mutex<HashMap<u64, String>>>,
}

#[async_trait]
impl EventHandler<OrderCreated> for OrderProjection {
    async fn handle(&self, event: OrderCreated) -> Result<(), MessagingError> {
        info!("order received: id={}, payload={:?}", event.id, event.payload);
        self.orders.lock().unwrap().insert(event.id, event.payload);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let orders = Arc::new(Mutex::new(HashMap::new()));
    let registry = Arc::new(
        EventRegistry::builder()
            .handler::<OrderCreated, _>("order_projection", OrderProjection {
                orders: orders.clone(),
            })
            .build()?,
    );
    let messaging_config = MessagingConfig::new()
        .topic("orders")
        .consumer("order_projection", ["orders"]);
    let topology = Arc::new(TopologyConfigurator::new(registry.clone(), messaging_config).build()?);

    let broker = Arc::new(InMemoryBroker::new());
    topology.declare(broker.as_ref()).await?;

    let outbox = Arc::new(InMemoryOutboxStorage::new());
    let inbox = Arc::new(InMemoryInboxStorage::new());
    let publisher = EventPublisher::new(outbox.clone(), registry.clone());

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx.clone());

    let processor_config = ProcessorConfig::default();
    let processor = PublishProcessor::new(
        outbox.clone(),
        broker.clone(),
        topology.clone(),
        processor_config.clone(),
        shutdown_rx.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = processor.run().await {
            error!("publish processor error: {}", e);
        }
    });

    let consumer_id = ConsumerId::new("order_projection");
    let queue = topology
        .queue_for(&consumer_id)
        .expect("queue derived for every registered consumer")
        .to_string();
    let consumer_config = ConsumerConfig::default();
    let listener = MessageListener::new(
        inbox.clone(),
        registry,
        consumer_id,
        consumer_config.clone(),
        shutdown_rx.clone(),
    );
    let worker = ConsumerWorker::new(
        broker.clone(),
        listener,
        queue,
        consumer_config,
        shutdown_rx.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!("consumer worker error: {}", e);
        }
    });

    tokio::spawn(
        OutboxCleanup::new(
            outbox.clone(),
            processor_config.outbox_cleanup_interval,
            processor_config.retention,
            shutdown_rx.clone(),
        )
        .run(),
    );
    tokio::spawn(
        InboxCleanup::new(
            inbox.clone(),
            processor_config.inbox_cleanup_interval,
            processor_config.retention,
            shutdown_rx.clone(),
        )
        .run(),
    );

    info!("emitting test events");
    publisher.emit(&OrderCreated { id: 1, payload: "first".to_string() }).await?;
    publisher.emit(&OrderCreated { id: 2, payload: "second".to_string() }).await?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("projected orders: {:?}", orders.lock().unwrap());

    shutdown_tx.send(true)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
