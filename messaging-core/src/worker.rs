use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::MessageBroker;
use crate::config::ConsumerConfig;
use crate::error::MessagingError;
use crate::listener::{ConsumeOutcome, MessageListener};
use crate::storage::InboxStorage;

/// Creates the shutdown channel shared by every run loop.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Flips the shutdown channel on SIGTERM or SIGINT.
pub fn spawn_signal_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to install SIGTERM handler: {}", e);
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
}

/// Owns the broker consume loop for one consumer group's queue.
///
/// Deliveries are handed to the [`MessageListener`]; its outcome is mapped
/// to ack / nack-requeue / nack-drop. A dropped broker connection is
/// retried with exponential backoff and jitter, since long-lived consumers
/// must survive transient partitions without operator help.
pub struct ConsumerWorker<I, B> {
    broker: Arc<B>,
    listener: MessageListener<I>,
    queue: String,
    config: ConsumerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<I, B> ConsumerWorker<I, B>
where
    I: InboxStorage + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(
        broker: Arc<B>,
        listener: MessageListener<I>,
        queue: impl Into<String>,
        config: ConsumerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            listener,
            queue: queue.into(),
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), MessagingError> {
        let mut backoff = self.config.reconnect_base;
        info!(queue = %self.queue, consumer = %self.listener.consumer_id(), "consumer started");

        while !*self.shutdown_rx.borrow() {
            match self.broker.consume(&self.queue).await {
                Ok(mut deliveries) => {
                    backoff = self.config.reconnect_base;
                    loop {
                        tokio::select! {
                            delivery = deliveries.recv() => {
                                let Some(delivery) = delivery else {
                                    warn!(queue = %self.queue, "consume stream closed, reconnecting");
                                    break;
                                };
                                let tag = delivery.tag;
                                let outcome = self.listener.on_message(&delivery).await;
                                let result = match outcome {
                                    ConsumeOutcome::Ack => self.broker.ack(tag).await,
                                    ConsumeOutcome::Requeue => self.broker.nack(tag, true).await,
                                    ConsumeOutcome::DeadLetter => self.broker.nack(tag, false).await,
                                };
                                if let Err(e) = result {
                                    error!(tag, "acknowledgement failed: {}", e);
                                }
                            }
                            _ = self.shutdown_rx.changed() => {
                                if *self.shutdown_rx.borrow() {
                                    info!(queue = %self.queue, "consumer stopping");
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                Err(MessagingError::BrokerConnection(e)) => {
                    let delay = backoff + jitter(self.config.reconnect_jitter);
                    warn!(
                        queue = %self.queue,
                        "broker connection failed ({}), retrying in {:?}", e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                    backoff = next_backoff(backoff, self.config.reconnect_max);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=max.as_millis() as u64))
}
