use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::inbox::{InboxError, InboxState, InboxStore};

/// Postgres inbox backing.
///
/// The at-most-one-row-per-key invariant lives in the composite primary key;
/// `try_add` is a unique-constrained insert (`ON CONFLICT DO NOTHING`), so
/// concurrent callers for one key admit exactly one row regardless of how
/// many consumer instances share the pool.
#[derive(Clone)]
pub struct SqlxInbox {
    pool: sqlx::PgPool,
}

impl SqlxInbox {
    /// Creates a new Postgres inbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, InboxError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS inbox_state (
                message_id UUID NOT NULL,
                consumer TEXT NOT NULL,
                received_time TIMESTAMPTZ NOT NULL,
                processed_time TIMESTAMPTZ,
                PRIMARY KEY (message_id, consumer)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| InboxError::backend(Box::new(e)))?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl InboxStore for SqlxInbox {
    #[tracing::instrument(skip_all, fields(message_id = %state.message_id))]
    async fn try_add(&self, state: InboxState) -> Result<bool, InboxError> {
        let result = sqlx::query(
            "INSERT INTO inbox_state (message_id, consumer, received_time, processed_time)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (message_id, consumer) DO NOTHING",
        )
        .bind(state.message_id)
        .bind(&state.consumer)
        .bind(state.received_time)
        .bind(state.processed_time)
        .execute(&self.pool)
        .await
        .map_err(|e| InboxError::backend(Box::new(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip_all, fields(message_id = %message_id))]
    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        sqlx::query(
            "UPDATE inbox_state SET processed_time = $3
             WHERE message_id = $1 AND consumer = $2",
        )
        .bind(message_id)
        .bind(consumer)
        .bind(processed_time)
        .execute(&self.pool)
        .await
        .map_err(|e| InboxError::backend(Box::new(e)))?;

        Ok(())
    }

    async fn get(
        &self,
        message_id: Uuid,
        consumer: &str,
    ) -> Result<Option<InboxState>, InboxError> {
        let row = sqlx::query(
            "SELECT message_id, consumer, received_time, processed_time
             FROM inbox_state WHERE message_id = $1 AND consumer = $2",
        )
        .bind(message_id)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| InboxError::backend(Box::new(e)))?;

        row.map(|row| {
            Ok(InboxState {
                message_id: row
                    .try_get("message_id")
                    .map_err(|e| InboxError::backend(Box::new(e)))?,
                consumer: row
                    .try_get("consumer")
                    .map_err(|e| InboxError::backend(Box::new(e)))?,
                received_time: row
                    .try_get("received_time")
                    .map_err(|e| InboxError::backend(Box::new(e)))?,
                processed_time: row
                    .try_get("processed_time")
                    .map_err(|e| InboxError::backend(Box::new(e)))?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    #[sqlx::test]
    async fn try_add_is_atomic_under_concurrency(pool: PgPool) {
        let inbox = SqlxInbox::try_new(pool).await.unwrap();
        let message_id = Uuid::now_v7();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let inbox = inbox.clone();
            tasks.push(tokio::spawn(async move {
                inbox
                    .try_add(InboxState::received(message_id, "billing"))
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[sqlx::test]
    async fn mark_processed_round_trips(pool: PgPool) {
        let inbox = SqlxInbox::try_new(pool).await.unwrap();
        let message_id = Uuid::now_v7();

        inbox
            .try_add(InboxState::received(message_id, "billing"))
            .await
            .unwrap();

        let processed = Utc::now();
        inbox
            .mark_processed(message_id, "billing", processed)
            .await
            .unwrap();

        let state = inbox.get(message_id, "billing").await.unwrap().unwrap();
        assert_eq!(
            state.processed_time.map(|t| t.timestamp_millis()),
            Some(processed.timestamp_millis())
        );
    }
}
