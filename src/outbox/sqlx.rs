use std::hash::{Hash, Hasher};
use std::time::Duration;

use ahash::AHasher;
use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use sqlx::Row;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::TransportMessage,
    outbox::{MarkDispatched, StagedMessage, StageMessages, StreamPending},
};

/// Postgres outbox backend for staging.
///
/// Envelopes are inserted inside the caller's transaction, so staged rows
/// commit and roll back with the application state that produced them. The
/// `BIGSERIAL` row id preserves staging order per connection; the relay
/// streams rows in id order.
#[derive(Clone)]
pub struct SqlxOutbox {
    pool: sqlx::PgPool,
}

impl SqlxOutbox {
    /// Creates a new Postgres outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, SqlxOutboxError> {
        create_table(&pool).await?;
        Ok(Self { pool })
    }

    /// The pool backing this outbox; staging callers begin their transactions
    /// on it.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait]
impl StageMessages for SqlxOutbox {
    type Error = SqlxOutboxError;
    type ID = i64;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all)]
    async fn stage_messages(
        &self,
        envelopes: Vec<TransportMessage>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        for envelope in envelopes {
            let partition = calculate_partition(&envelope.identity().partition_id());
            let payload = serde_json::to_value(&envelope)?;

            sqlx::query(
                "INSERT INTO outbox (partition, message_type, envelope) VALUES ($1, $2, $3)",
            )
            .bind(partition)
            .bind(envelope.message_type())
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

/// A relay instance's slice of the partition space.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub id: u32,
    pub total: u32,
}

/// Postgres relay source: polls pending outbox rows and settles them.
///
/// Multiple relay instances split the table by `partition % total = id`, so
/// rows sharing a partition id (one conversation) always flow through one
/// instance and keep their relative order.
#[derive(Clone)]
pub struct SqlxOutboxRelaySource {
    pool: sqlx::PgPool,
    poll_interval: Duration,
    fetch_size: usize,
    logical_delete: bool,
    partition: Partition,
}

impl SqlxOutboxRelaySource {
    /// Creates a new relay source and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(
        pool: sqlx::PgPool,
        poll_interval: Duration,
    ) -> Result<Self, SqlxOutboxError> {
        create_table(&pool).await?;
        Ok(Self {
            pool,
            poll_interval,
            fetch_size: 1000,
            logical_delete: true,
            partition: Partition { id: 0, total: 1 },
        })
    }

    /// Sets the fetch size for batch queries.
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// Uses permanent deletion instead of logical deletion.
    pub fn with_permanent_delete(mut self) -> Self {
        self.logical_delete = false;
        self
    }

    /// Restricts this instance to one slice of the partition space.
    pub fn with_partitions(mut self, total: u32, partition_id: u32) -> Self {
        self.partition = Partition {
            total,
            id: partition_id,
        };
        self
    }

    #[tracing::instrument(skip_all, fields(partition = ?self.partition))]
    async fn fetch_pending(
        &self,
        fetch_size: usize,
    ) -> Result<Vec<StagedMessage<i64>>, SqlxOutboxError> {
        let mut rows = sqlx::query(
            "SELECT outbox_id, envelope FROM outbox
             WHERE dispatched = FALSE AND (partition % $1 = $2)
             ORDER BY outbox_id LIMIT $3",
        )
        .bind(self.partition.total as i32)
        .bind(self.partition.id as i32)
        .bind(fetch_size as i64)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let id: i64 = row.try_get("outbox_id")?;
            let payload: serde_json::Value = row.try_get("envelope")?;
            out.push(StagedMessage {
                id,
                envelope: serde_json::from_value(payload)?,
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl StreamPending for SqlxOutboxRelaySource {
    type Error = tower::BoxError;
    type ID = i64;

    /// Poll the table on the configured interval, yielding fetched rows one
    /// at a time.
    ///
    /// The stream ends once `cancel` fires. A failed fetch yields the error
    /// and polling resumes on the next tick, so a transient database fault
    /// does not kill the stream.
    #[tracing::instrument(skip_all)]
    async fn pending(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<StagedMessage<Self::ID>, Self::Error>>, Self::Error> {
        let this = self.clone();
        let stream = stream! {
            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.fetch_pending(this.fetch_size).await {
                            Ok(batch) => {
                                for message in batch {
                                    yield Ok(message);
                                }
                            }
                            Err(err) => yield Err(err.into()),
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl MarkDispatched for SqlxOutboxRelaySource {
    type Error = tower::BoxError;
    type ID = i64;

    /// Settle rows the relay has published.
    ///
    /// Rows already settled by another relay instance affect zero rows and
    /// are not an error.
    async fn mark_dispatched(
        &self,
        messages: Vec<StagedMessage<Self::ID>>,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        let query = if self.logical_delete {
            "UPDATE outbox SET dispatched = TRUE, dispatched_time = NOW()
             WHERE outbox_id = $1 AND dispatched = FALSE"
        } else {
            "DELETE FROM outbox WHERE outbox_id = $1"
        };
        for message in messages {
            sqlx::query(query).bind(message.id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Ensures the outbox table exists.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), SqlxOutboxError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            outbox_id BIGSERIAL PRIMARY KEY,
            partition INT NOT NULL DEFAULT 0,
            message_type TEXT NOT NULL,
            envelope JSONB NOT NULL,
            dispatched BOOL NOT NULL DEFAULT FALSE,
            dispatched_time TIMESTAMPTZ,
            created_time TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres outbox errors.
#[derive(Debug)]
pub struct SqlxOutboxError {
    context: tracing_error::SpanTrace,
    kind: SqlxOutboxErrorKind,
}

#[derive(Debug)]
pub enum SqlxOutboxErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for SqlxOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxOutboxErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxOutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SqlxOutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxOutboxErrorKind::Database(err) => Some(err),
            SqlxOutboxErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for SqlxOutboxError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxOutboxErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for SqlxOutboxError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxOutboxErrorKind::Serde(err),
        }
    }
}

/// Maps a partition id onto a stable non-negative bucket.
fn calculate_partition<K: Hash>(key: &K) -> i32 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % i32::MAX as u64) as i32
}
