use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch::Receiver;
use tracing::{debug, error, info};

use crate::storage::{InboxStorage, OutboxStorage};

/// Prunes published outbox rows older than the retention window.
pub struct OutboxCleanup<S> {
    storage: Arc<S>,
    interval: Duration,
    retention: Duration,
    shutdown_rx: Receiver<bool>,
}

impl<S> OutboxCleanup<S>
where
    S: OutboxStorage + 'static,
{
    pub fn new(
        storage: Arc<S>,
        interval: Duration,
        retention: Duration,
        shutdown_rx: Receiver<bool>,
    ) -> Self {
        Self { storage, interval, retention, shutdown_rx }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        info!("outbox cleanup started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged only; the rows remain and the
                    // next tick picks them up.
                    match self.storage.remove_sent(self.retention).await {
                        Ok(0) => {}
                        Ok(count) => debug!("removed {} published outbox rows", count),
                        Err(e) => error!("outbox cleanup error: {}", e),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("outbox cleanup stopped");
    }
}

/// Prunes processed inbox rows older than the retention window.
pub struct InboxCleanup<I> {
    storage: Arc<I>,
    interval: Duration,
    retention: Duration,
    shutdown_rx: Receiver<bool>,
}

impl<I> InboxCleanup<I>
where
    I: InboxStorage + 'static,
{
    pub fn new(
        storage: Arc<I>,
        interval: Duration,
        retention: Duration,
        shutdown_rx: Receiver<bool>,
    ) -> Self {
        Self { storage, interval, retention, shutdown_rx }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        info!("inbox cleanup started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.storage.remove_processed(self.retention).await {
                        Ok(0) => {}
                        Ok(count) => debug!("removed {} processed inbox rows", count),
                        Err(e) => error!("inbox cleanup error: {}", e),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("inbox cleanup stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockInboxStorage, MockOutboxStorage};
    use tokio::sync::watch;

    #[tokio::test]
    async fn outbox_cleanup_prunes_and_stops_on_shutdown() {
        let mut storage = MockOutboxStorage::new();
        storage
            .expect_remove_sent()
            .withf(|retention| *retention == Duration::from_secs(60))
            .returning(|_| Ok(2));

        let (tx, rx) = watch::channel(false);
        let cleanup = OutboxCleanup::new(
            Arc::new(storage),
            Duration::from_millis(10),
            Duration::from_secs(60),
            rx,
        );
        let handle = tokio::spawn(cleanup.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup did not stop in time")
            .unwrap();
    }

    #[tokio::test]
    async fn inbox_cleanup_survives_storage_errors() {
        let mut storage = MockInboxStorage::new();
        storage.expect_remove_processed().returning(|_| {
            Err(crate::error::MessagingError::Infrastructure("db away".to_string()))
        });

        let (tx, rx) = watch::channel(false);
        let cleanup = InboxCleanup::new(
            Arc::new(storage),
            Duration::from_millis(10),
            Duration::from_secs(60),
            rx,
        );
        let handle = tokio::spawn(cleanup.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup did not stop in time")
            .unwrap();
    }
}
