use std::sync::Arc;

use tokio::sync::watch::Receiver;
use tracing::{debug, error, warn};

use crate::broker::Delivery;
use crate::config::ConsumerConfig;
use crate::error::MessagingError;
use crate::model::InboxRecord;
use crate::object::{ConsumerId, EventType, MessageId};
use crate::registry::EventRegistry;
use crate::storage::InboxStorage;

/// Cross-cutting wrapper around handler dispatch: logging, metrics,
/// transaction management. `before` hooks run in registration order inside
/// the dispatch deadline; `after` hooks run in reverse order and observe
/// the dispatch result.
#[async_trait::async_trait]
pub trait ConsumerMiddleware: Send + Sync {
    /// Runs before the handlers; an error fails the dispatch.
    async fn before(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        let _ = delivery;
        Ok(())
    }

    /// Runs after the handlers, successful or not.
    async fn after(&self, delivery: &Delivery, result: &Result<(), MessagingError>) {
        let _ = (delivery, result);
    }
}

/// What the worker should tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Acknowledge: processed now, or already processed earlier.
    Ack,
    /// Negative-acknowledge with requeue: transient handler failure, the
    /// broker will redeliver.
    Requeue,
    /// Negative-acknowledge without requeue: the message goes to the
    /// dead-letter exchange.
    DeadLetter,
}

/// Consumer-side dispatch: deduplicates via the inbox table, runs the
/// registered handlers under a deadline, and decides the acknowledgement.
pub struct MessageListener<I> {
    inbox: Arc<I>,
    registry: Arc<EventRegistry>,
    consumer_id: ConsumerId,
    config: ConsumerConfig,
    middleware: Vec<Arc<dyn ConsumerMiddleware>>,
    shutdown_rx: Receiver<bool>,
}

impl<I> MessageListener<I>
where
    I: InboxStorage,
{
    pub fn new(
        inbox: Arc<I>,
        registry: Arc<EventRegistry>,
        consumer_id: ConsumerId,
        config: ConsumerConfig,
        shutdown_rx: Receiver<bool>,
    ) -> Self {
        Self {
            inbox,
            registry,
            consumer_id,
            config,
            middleware: Vec::new(),
            shutdown_rx,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn ConsumerMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    /// Handles one delivery end to end and returns the acknowledgement
    /// decision. Broker interaction is left to the caller.
    pub async fn on_message(&self, delivery: &Delivery) -> ConsumeOutcome {
        let message_id = match MessageId::parse(&delivery.properties.message_id) {
            Ok(id) => id,
            Err(e) => {
                error!("delivery carries malformed message id: {}", e);
                return ConsumeOutcome::DeadLetter;
            }
        };
        let name = EventType::new(delivery.properties.event_type.clone());

        let record = InboxRecord::new(message_id, self.consumer_id.clone(), name.clone());
        let stored = match self.inbox.upsert(record).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(message_id = %message_id, "inbox upsert failed: {}", e);
                return ConsumeOutcome::Requeue;
            }
        };

        if stored.is_processed() {
            debug!(message_id = %message_id, "duplicate delivery short-circuited");
            return ConsumeOutcome::Ack;
        }

        let handlers = self.registry.handlers_for(&self.consumer_id, &name);
        if handlers.is_empty() {
            // Redelivery cannot fix a missing registration; surface the
            // misconfiguration on the dead-letter queue.
            warn!(event_type = %name, "no handler registered, dead-lettering");
            return ConsumeOutcome::DeadLetter;
        }

        match self.dispatch_with_deadline(handlers, delivery).await {
            Ok(()) => {}
            Err(MessagingError::HandlerTimeout(timeout)) => {
                error!(
                    message_id = %message_id,
                    "handlers exceeded {:?}, dead-lettering", timeout
                );
                return ConsumeOutcome::DeadLetter;
            }
            Err(e) => {
                if stored.counter < self.config.max_retries {
                    warn!(
                        message_id = %message_id,
                        attempt = stored.counter,
                        "handler failed, requeueing: {}", e
                    );
                    return ConsumeOutcome::Requeue;
                }
                error!(
                    message_id = %message_id,
                    attempts = stored.counter,
                    "retries exhausted, dead-lettering: {}", e
                );
                return ConsumeOutcome::DeadLetter;
            }
        }

        match self
            .inbox
            .mark_as_processed(&message_id, &self.consumer_id)
            .await
        {
            Ok(()) => ConsumeOutcome::Ack,
            Err(e) => {
                // The handlers ran but the mark is missing; a redelivery
                // lands on the unprocessed row and retries, which is the
                // at-least-once contract.
                error!(message_id = %message_id, "mark-as-processed failed: {}", e);
                ConsumeOutcome::Requeue
            }
        }
    }

    /// Runs every handler under the configured deadline, retrying a timed
    /// out dispatch up to `timeout_retries` times. The deadline fires at
    /// the dispatch await point; a handler that never yields is not
    /// interrupted. Shutdown suppresses further timeout retries so
    /// in-flight work cannot extend it indefinitely.
    async fn dispatch_with_deadline(
        &self,
        handlers: &[Arc<dyn crate::registry::ErasedHandler>],
        delivery: &Delivery,
    ) -> Result<(), MessagingError> {
        let mut attempts_left = 1 + self.config.timeout_retries;
        loop {
            attempts_left -= 1;
            let dispatch = async {
                let mut result = Ok(());
                for middleware in &self.middleware {
                    if let Err(e) = middleware.before(delivery).await {
                        result = Err(e);
                        break;
                    }
                }
                if result.is_ok() {
                    for handler in handlers {
                        if let Err(e) = handler.dispatch(&delivery.body).await {
                            result = Err(e);
                            break;
                        }
                    }
                }
                for middleware in self.middleware.iter().rev() {
                    middleware.after(delivery, &result).await;
                }
                result
            };
            match tokio::time::timeout(self.config.handler_timeout, dispatch).await {
                Ok(result) => return result,
                Err(_) => {
                    if attempts_left == 0 || *self.shutdown_rx.borrow() {
                        return Err(MessagingError::HandlerTimeout(self.config.handler_timeout));
                    }
                    warn!("handler dispatch timed out, retrying");
                }
            }
        }
    }
}
