use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Declared messaging surface: the topic universe and which consumer groups
/// subscribe to which topics. Cross-checked against the event registry by
/// the topology configurator before anything is declared on the broker.
#[derive(Debug, Clone, Default)]
pub struct MessagingConfig {
    pub topics: BTreeSet<String>,
    pub consumers: BTreeMap<String, BTreeSet<String>>,
}

impl MessagingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    pub fn consumer<I, S>(mut self, consumer_id: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumers
            .insert(consumer_id.into(), topics.into_iter().map(Into::into).collect());
        self
    }
}

/// Tuning for the publish processor and the cleanup loops.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub poll_interval: Duration,
    pub outbox_cleanup_interval: Duration,
    pub inbox_cleanup_interval: Duration,
    pub retention: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            outbox_cleanup_interval: Duration::from_secs(15),
            inbox_cleanup_interval: Duration::from_secs(35),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Tuning for the consumer side: handler deadline, retry budgets and the
/// reconnect backoff window.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deadline for one dispatch of all handlers of a message.
    pub handler_timeout: Duration,
    /// Extra in-place attempts after a timeout before the message is
    /// dead-lettered.
    pub timeout_retries: u32,
    /// Broker redeliveries allowed for a failing handler before the message
    /// is dead-lettered.
    pub max_retries: i32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(15),
            timeout_retries: 1,
            max_retries: 3,
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: Duration::from_millis(250),
        }
    }
}
