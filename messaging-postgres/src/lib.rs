//! PostgreSQL backends for the messaging core.
//!
//! The outbox insert is exposed both through [`PostgresOutboxStorage::save`]
//! (pool-bound, for callers without an open transaction) and through
//! [`PostgresOutboxStorage::save_in`], which takes any executor so the row
//! can be written inside the caller's own transaction, committing together
//! with the business change.

use std::time::Duration;

use async_trait::async_trait;
use messaging_core::prelude::{
    ConsumerId, InboxRecord, InboxStorage, MessageId, MessagingError, OutboxMessage,
    OutboxStorage,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS winter_outbox_message (
    id BIGSERIAL PRIMARY KEY,
    message_id UUID NOT NULL UNIQUE,
    topic TEXT NOT NULL,
    type TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    published_at TIMESTAMPTZ
)
"#;

const CREATE_INBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS winter_inbox_message (
    id UUID NOT NULL,
    consumer_id TEXT NOT NULL,
    name TEXT NOT NULL,
    counter INT NOT NULL DEFAULT 0,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at TIMESTAMPTZ,
    PRIMARY KEY (id, consumer_id)
)
"#;

/// Creates both messaging tables if they do not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<(), MessagingError> {
    sqlx::query(CREATE_OUTBOX_TABLE)
        .execute(pool)
        .await
        .map_err(infra)?;
    sqlx::query(CREATE_INBOX_TABLE)
        .execute(pool)
        .await
        .map_err(infra)?;
    Ok(())
}

fn infra(e: sqlx::Error) -> MessagingError {
    MessagingError::Infrastructure(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

pub struct PostgresOutboxStorage {
    pool: PgPool,
}

impl PostgresOutboxStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts an outbox row through the given executor. Pass the caller's
    /// open transaction to commit the row atomically with the business
    /// change.
    pub async fn save_in<'e, E>(executor: E, message: &OutboxMessage) -> Result<(), MessagingError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO winter_outbox_message (message_id, topic, type, body, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.message_id.as_uuid())
        .bind(message.topic.as_str())
        .bind(message.event_type.as_str())
        .bind(&message.body)
        .bind(message.created_at)
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(MessagingError::DuplicateMessage(message.message_id))
            }
            Err(e) => Err(infra(e)),
        }
    }
}

#[async_trait]
impl OutboxStorage for PostgresOutboxStorage {
    async fn save(&self, message: OutboxMessage) -> Result<(), MessagingError> {
        Self::save_in(&self.pool, &message).await
    }

    async fn select_unsent(&self) -> Result<Vec<OutboxMessage>, MessagingError> {
        sqlx::query_as::<_, OutboxMessage>(
            r#"
            SELECT message_id, topic, type AS event_type, body, created_at, published_at
            FROM winter_outbox_message
            WHERE published_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(infra)
    }

    async fn mark_as_sent(&self, ids: &[MessageId]) -> Result<(), MessagingError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE winter_outbox_message
            SET published_at = now()
            WHERE message_id = ANY($1) AND published_at IS NULL
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn remove_sent(&self, retention: Duration) -> Result<u64, MessagingError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let result = sqlx::query(
            r#"
            DELETE FROM winter_outbox_message
            WHERE published_at IS NOT NULL AND published_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        debug!("pruned {} published outbox rows", result.rows_affected());
        Ok(result.rows_affected())
    }
}

pub struct PostgresInboxStorage {
    pool: PgPool,
}

impl PostgresInboxStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStorage for PostgresInboxStorage {
    async fn upsert(&self, record: InboxRecord) -> Result<InboxRecord, MessagingError> {
        // The conflict path increments the stored counter and hands the row
        // back in one round trip, which is the whole deduplication check.
        sqlx::query_as::<_, InboxRecord>(
            r#"
            INSERT INTO winter_inbox_message (id, consumer_id, name, counter, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id, consumer_id)
            DO UPDATE SET counter = winter_inbox_message.counter + 1
            RETURNING id AS message_id, consumer_id, name, counter, received_at, processed_at
            "#,
        )
        .bind(record.message_id.as_uuid())
        .bind(record.consumer_id.as_str())
        .bind(record.name.as_str())
        .bind(record.counter)
        .bind(record.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(infra)
    }

    async fn mark_as_processed(
        &self,
        message_id: &MessageId,
        consumer_id: &ConsumerId,
    ) -> Result<(), MessagingError> {
        sqlx::query(
            r#"
            UPDATE winter_inbox_message
            SET processed_at = now()
            WHERE id = $1 AND consumer_id = $2 AND processed_at IS NULL
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(consumer_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn remove_processed(&self, retention: Duration) -> Result<u64, MessagingError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let result = sqlx::query(
            r#"
            DELETE FROM winter_inbox_message
            WHERE processed_at IS NOT NULL AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        debug!("pruned {} processed inbox rows", result.rows_affected());
        Ok(result.rows_affected())
    }
}
