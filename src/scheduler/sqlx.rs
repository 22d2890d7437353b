use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::scheduler::{ScheduledMessage, ScheduledStore, SchedulerError};

/// Postgres scheduled-message backing.
///
/// `mark_dispatched` is a single conditional statement (row-guarded update or
/// delete), so dispatcher replicas sharing the pool cannot both win the mark
/// for one token. Uses logical deletion by default; permanent deletion drops
/// the row instead of stamping `dispatched_time`.
#[derive(Clone)]
pub struct SqlxScheduledStore {
    pool: sqlx::PgPool,
    logical_delete: bool,
}

impl SqlxScheduledStore {
    /// Creates a new Postgres store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, SchedulerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scheduled_messages (
                token UUID PRIMARY KEY,
                message_type TEXT NOT NULL,
                envelope JSONB NOT NULL,
                scheduled_time TIMESTAMPTZ NOT NULL,
                created_time TIMESTAMPTZ NOT NULL,
                dispatched_time TIMESTAMPTZ
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_due
             ON scheduled_messages (scheduled_time, token)
             WHERE dispatched_time IS NULL",
        )
        .execute(&pool)
        .await
        .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        Ok(Self {
            pool,
            logical_delete: true,
        })
    }

    /// Uses permanent deletion instead of logical deletion.
    pub fn with_permanent_delete(mut self) -> Self {
        self.logical_delete = false;
        self
    }
}

#[async_trait::async_trait]
impl ScheduledStore for SqlxScheduledStore {
    #[tracing::instrument(skip_all, fields(token = %message.token))]
    async fn add(&self, message: ScheduledMessage) -> Result<(), SchedulerError> {
        let envelope = serde_json::to_value(&message.envelope)
            .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO scheduled_messages
                 (token, message_type, envelope, scheduled_time, created_time, dispatched_time)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.token)
        .bind(message.message_type())
        .bind(envelope)
        .bind(message.scheduled_time)
        .bind(message.created_time)
        .bind(message.dispatched_time)
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ScheduledMessage>, SchedulerError> {
        let rows = sqlx::query(
            "SELECT token, envelope, scheduled_time, created_time, dispatched_time
             FROM scheduled_messages
             WHERE dispatched_time IS NULL AND scheduled_time <= $1
             ORDER BY scheduled_time, token
             LIMIT $2",
        )
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let envelope: serde_json::Value = row
                .try_get("envelope")
                .map_err(|e| SchedulerError::backend(Box::new(e)))?;
            due.push(ScheduledMessage {
                token: row
                    .try_get("token")
                    .map_err(|e| SchedulerError::backend(Box::new(e)))?,
                envelope: serde_json::from_value(envelope)
                    .map_err(|e| SchedulerError::backend(Box::new(e)))?,
                scheduled_time: row
                    .try_get("scheduled_time")
                    .map_err(|e| SchedulerError::backend(Box::new(e)))?,
                created_time: row
                    .try_get("created_time")
                    .map_err(|e| SchedulerError::backend(Box::new(e)))?,
                dispatched_time: row
                    .try_get("dispatched_time")
                    .map_err(|e| SchedulerError::backend(Box::new(e)))?,
            });
        }

        Ok(due)
    }

    #[tracing::instrument(skip_all, fields(token = %token))]
    async fn mark_dispatched(&self, token: Uuid) -> Result<bool, SchedulerError> {
        let query = if self.logical_delete {
            "UPDATE scheduled_messages SET dispatched_time = NOW()
             WHERE token = $1 AND dispatched_time IS NULL"
        } else {
            "DELETE FROM scheduled_messages WHERE token = $1"
        };

        let result = sqlx::query(query)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::backend(Box::new(e)))?;

        Ok(result.rows_affected() > 0)
    }
}
