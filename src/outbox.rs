//! Transactional staging of outgoing messages.
//!
//! The outbox pattern: an envelope is staged in the same transaction as the
//! state change that triggered it, so a rollback also discards the message
//! and a commit guarantees eventual publication. A post-commit relay streams
//! pending rows, forwards them to the transport and marks them dispatched.
//!
//! ## Guarantees
//!
//! - Messages staged within one unit of work dispatch in staging order for
//!   that unit of work; there is no ordering across units of work.
//! - A relay crash between commit and dispatch leaves rows pending; the next
//!   relay pass retries them (at-least-once), and consumers absorb the
//!   duplicates through the inbox.
//!
//! ## Components
//!
//! - [`Outbox`]: high-level facade over an outbox backend
//! - [`StageMessages`]: trait for staging envelopes inside a transaction
//! - [`StreamPending`]: trait for streaming undispatched rows
//! - [`MarkDispatched`]: trait for settling dispatched rows
//!
//! Concrete backends live in [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::envelope::TransportMessage;

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl OutboxError {
    /// Create a backend-related outbox error.
    fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A staged envelope together with its backend-assigned row id.
///
/// Row ids are monotonically increasing per backend, which is what preserves
/// staging order within a unit of work.
#[derive(Debug, PartialEq)]
pub struct StagedMessage<ID> {
    pub(crate) id: ID,
    pub(crate) envelope: TransportMessage,
}

impl<ID> StagedMessage<ID> {
    pub fn envelope(&self) -> &TransportMessage {
        &self.envelope
    }
}

/// High-level facade over an outbox backend.
pub struct Outbox<D>(D);

impl<D> Outbox<D>
where
    D: Clone,
{
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Stage envelopes for post-commit publication.
    ///
    /// The envelopes are inserted into the outbox but **not** sent; delivery
    /// happens asynchronously once the surrounding transaction commits. This
    /// method is called within the same transaction that mutates application
    /// state, so a rollback discards the staged messages too.
    #[instrument(skip(self, envelopes, tx))]
    pub async fn stage(
        &self,
        envelopes: impl IntoIterator<Item = TransportMessage>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), OutboxError>
    where
        D: StageMessages,
        <D as StageMessages>::Error: Into<tower::BoxError>,
    {
        let envelopes: Vec<TransportMessage> = envelopes.into_iter().collect();

        self.0
            .stage_messages(envelopes, tx)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }
}

/// Trait for staging envelopes inside the caller's transaction.
#[async_trait::async_trait]
pub trait StageMessages {
    /// Backend-specific error type.
    type Error;
    /// Identifier type assigned to staged rows.
    type ID;
    /// Transaction type used for atomic staging.
    type Transaction<'a>;

    /// Insert a batch of envelopes into the outbox, preserving batch order.
    async fn stage_messages(
        &self,
        envelopes: Vec<TransportMessage>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for settling rows the relay has published.
///
/// Settling a row that is already gone is a benign no-op, never an error;
/// relay replicas race on the same rows.
#[async_trait::async_trait]
pub trait MarkDispatched {
    /// Backend-specific error type.
    type Error;
    /// Identifier type for staged rows.
    type ID;

    /// Mark rows dispatched so the next poll excludes them.
    async fn mark_dispatched(
        &self,
        messages: Vec<StagedMessage<Self::ID>>,
    ) -> Result<(), Self::Error>;
}

/// Trait for streaming undispatched rows.
///
/// The returned stream yields rows in staging order and respects cancellation
/// via the provided [`CancellationToken`].
#[async_trait::async_trait]
pub trait StreamPending {
    /// Backend-specific error type.
    type Error;
    /// Identifier type for staged rows.
    type ID;

    /// Stream pending rows until exhaustion or cancellation.
    async fn pending(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<StagedMessage<Self::ID>, Self::Error>>, Self::Error>;
}
