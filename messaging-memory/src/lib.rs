//! In-memory backends for the messaging core: a topic-exchange broker with
//! manual acknowledgement and dead-lettering, and outbox/inbox stores with
//! the same key semantics as the SQL schema. Used by the integration
//! test-suite and the runnable example.

mod broker;
mod inbox;
mod outbox;

pub use broker::InMemoryBroker;
pub use inbox::InMemoryInboxStorage;
pub use outbox::InMemoryOutboxStorage;
