//! Idempotent-consumer ledger.
//!
//! The inbox guarantees a given `(message id, consumer)` pair is handled at
//! most once despite at-least-once delivery and consumer crashes. Backends
//! only expose three primitives: a unique-constrained insert ([`try_add`]),
//! an unconditional mark ([`mark_processed`]) and a read ([`get`]); no
//! broader read-then-write sequence is safe, because multiple consumer
//! instances act on the same rows concurrently.
//!
//! [`try_add`]: InboxStore::try_add
//! [`mark_processed`]: InboxStore::mark_processed
//! [`get`]: InboxStore::get

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{envelope::TransportMessage, transport::Handler};

pub use inmemory::InMemoryInbox;

/// One row of the dedup ledger, keyed by `(message id, consumer)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxState {
    pub message_id: Uuid,
    pub consumer: String,
    pub received_time: DateTime<Utc>,
    /// Absent until the handler has completed successfully.
    pub processed_time: Option<DateTime<Utc>>,
}

impl InboxState {
    pub fn received(message_id: Uuid, consumer: impl Into<String>) -> Self {
        Self {
            message_id,
            consumer: consumer.into(),
            received_time: Utc::now(),
            processed_time: None,
        }
    }
}

/// Storage backing for the dedup ledger.
///
/// The at-most-one-row-per-key invariant is enforced by the backend (unique
/// constraint, compare-and-insert), never by application-level checks.
#[async_trait::async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert a new row if the composite key is absent.
    ///
    /// Returns `true` on success, `false` when the key already exists. Of N
    /// concurrent calls for the same key, exactly one returns `true`.
    async fn try_add(&self, state: InboxState) -> Result<bool, InboxError>;

    /// Set the processed time on an existing row, unconditionally.
    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<(), InboxError>;

    /// Current state for a key, or `None`.
    async fn get(&self, message_id: Uuid, consumer: &str)
        -> Result<Option<InboxState>, InboxError>;
}

/// When the dedup row is committed relative to the handler run.
///
/// `BeforeProcess` records the message as seen before invoking the handler:
/// a crash between the insert and the processed mark means the redelivered
/// message is skipped even though it was never handled. `AfterProcess`
/// commits the dedup row only after successful handling: a crash mid-handler
/// means the redelivery runs the handler again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupMode {
    #[default]
    BeforeProcess,
    AfterProcess,
}

/// What the consumer protocol decided about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler ran and completed.
    Handled,
    /// The message was already seen; the handler body was skipped. The
    /// delivery must still be acknowledged.
    Duplicate,
    /// The envelope carries no message id, so deduplication cannot apply;
    /// the handler ran.
    NotDeduplicable,
}

/// Inbox-guarded consumer wrapping a business-logic [`Handler`].
///
/// Implements the consumer protocol over an [`InboxStore`]: duplicates are
/// skipped (and still acknowledged), fresh messages run the handler and are
/// marked processed. Handler failures propagate so the broker redelivers;
/// they never corrupt the dedup ledger.
pub struct IdempotentConsumer<S> {
    store: S,
    consumer: String,
    mode: DedupMode,
}

impl<S> IdempotentConsumer<S>
where
    S: InboxStore,
{
    pub fn new(store: S, consumer: impl Into<String>) -> Self {
        Self {
            store,
            consumer: consumer.into(),
            mode: DedupMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DedupMode) -> Self {
        self.mode = mode;
        self
    }

    #[tracing::instrument(skip_all, fields(consumer = %self.consumer))]
    pub async fn consume<H>(
        &self,
        envelope: TransportMessage,
        handler: &H,
    ) -> Result<Disposition, ConsumeError>
    where
        H: Handler,
    {
        let Some(message_id) = envelope.identity().message_id else {
            handler
                .handle(envelope)
                .await
                .map_err(ConsumeError::handler)?;
            return Ok(Disposition::NotDeduplicable);
        };

        match self.mode {
            DedupMode::BeforeProcess => self.dedup_before(message_id, envelope, handler).await,
            DedupMode::AfterProcess => self.dedup_after(message_id, envelope, handler).await,
        }
    }

    async fn dedup_before<H>(
        &self,
        message_id: Uuid,
        envelope: TransportMessage,
        handler: &H,
    ) -> Result<Disposition, ConsumeError>
    where
        H: Handler,
    {
        let state = InboxState::received(message_id, self.consumer.clone());
        if !self.store.try_add(state).await.map_err(ConsumeError::inbox)? {
            tracing::debug!(%message_id, "duplicate detected, skipping handler");
            return Ok(Disposition::Duplicate);
        }

        handler
            .handle(envelope)
            .await
            .map_err(ConsumeError::handler)?;

        self.store
            .mark_processed(message_id, &self.consumer, Utc::now())
            .await
            .map_err(ConsumeError::inbox)?;

        Ok(Disposition::Handled)
    }

    async fn dedup_after<H>(
        &self,
        message_id: Uuid,
        envelope: TransportMessage,
        handler: &H,
    ) -> Result<Disposition, ConsumeError>
    where
        H: Handler,
    {
        if self
            .store
            .get(message_id, &self.consumer)
            .await
            .map_err(ConsumeError::inbox)?
            .is_some()
        {
            tracing::debug!(%message_id, "duplicate detected, skipping handler");
            return Ok(Disposition::Duplicate);
        }

        handler
            .handle(envelope)
            .await
            .map_err(ConsumeError::handler)?;

        // Commit the dedup row only now; losing the insert race to another
        // replica is benign (both handled the message, which at-least-once
        // delivery permits).
        let state = InboxState::received(message_id, self.consumer.clone());
        if self.store.try_add(state).await.map_err(ConsumeError::inbox)? {
            self.store
                .mark_processed(message_id, &self.consumer, Utc::now())
                .await
                .map_err(ConsumeError::inbox)?;
        }

        Ok(Disposition::Handled)
    }
}

/// Error returned by inbox store operations.
#[derive(Debug)]
pub struct InboxError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl InboxError {
    /// Create a backend-related inbox error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Error returned by the consumer protocol.
#[derive(Debug)]
pub struct ConsumeError {
    context: SpanTrace,
    kind: ConsumeErrorKind,
}

/// Consumer protocol error kinds.
#[derive(Debug)]
pub enum ConsumeErrorKind {
    /// The inbox store failed; the delivery outcome is unknown.
    Inbox(InboxError),
    /// Business logic failed; the broker should redeliver.
    Handler(tower::BoxError),
}

impl ConsumeError {
    fn inbox(err: InboxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumeErrorKind::Inbox(err),
        }
    }

    fn handler(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumeErrorKind::Handler(err),
        }
    }

    pub fn kind(&self) -> &ConsumeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumeErrorKind::Inbox(err) => writeln!(f, "Inbox error: {err}"),
            ConsumeErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumeErrorKind::Inbox(err) => Some(err),
            ConsumeErrorKind::Handler(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::envelope::Identity;

    struct Counting {
        calls: AtomicU32,
        fail_first: bool,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: false,
            }
        }

        fn failing_once() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: true,
            }
        }
    }

    #[async_trait::async_trait]
    impl Handler for Counting {
        async fn handle(&self, _envelope: TransportMessage) -> Result<(), tower::BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_first && call == 1 {
                Err("crash before mark".into())
            } else {
                Ok(())
            }
        }
    }

    fn envelope() -> TransportMessage {
        TransportMessage::build("OrderPlaced", Identity::for_message()).finish()
    }

    #[tokio::test]
    async fn duplicate_delivery_skips_the_handler() {
        let consumer = IdempotentConsumer::new(InMemoryInbox::default(), "billing");
        let handler = Counting::new();
        let envelope = envelope();

        let first = consumer.consume(envelope.clone(), &handler).await.unwrap();
        let second = consumer.consume(envelope, &handler).await.unwrap();

        assert_eq!(first, Disposition::Handled);
        assert_eq!(second, Disposition::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn processed_time_is_recorded_after_success() {
        let store = InMemoryInbox::default();
        let consumer = IdempotentConsumer::new(store.clone(), "billing");
        let envelope = envelope();
        let message_id = envelope.identity().message_id.unwrap();

        consumer.consume(envelope, &Counting::new()).await.unwrap();

        let state = store.get(message_id, "billing").await.unwrap().unwrap();
        assert!(state.processed_time.is_some());
    }

    #[tokio::test]
    async fn missing_message_id_bypasses_deduplication() {
        let consumer = IdempotentConsumer::new(InMemoryInbox::default(), "billing");
        let handler = Counting::new();
        let envelope = TransportMessage::build("OrderPlaced", Identity::empty()).finish();

        let first = consumer.consume(envelope.clone(), &handler).await.unwrap();
        let second = consumer.consume(envelope, &handler).await.unwrap();

        assert_eq!(first, Disposition::NotDeduplicable);
        assert_eq!(second, Disposition::NotDeduplicable);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dedup_before_skips_redelivery_after_mid_handling_crash() {
        // Documented tension: the dedup row is committed before the handler
        // runs, so a crash between the two permanently skips the message.
        let consumer = IdempotentConsumer::new(InMemoryInbox::default(), "billing");
        let handler = Counting::failing_once();
        let envelope = envelope();

        let first = consumer.consume(envelope.clone(), &handler).await;
        assert!(matches!(
            first.unwrap_err().kind(),
            ConsumeErrorKind::Handler(_)
        ));

        let redelivery = consumer.consume(envelope, &handler).await.unwrap();
        assert_eq!(redelivery, Disposition::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_after_reprocesses_redelivery_after_mid_handling_crash() {
        let consumer = IdempotentConsumer::new(InMemoryInbox::default(), "billing")
            .with_mode(DedupMode::AfterProcess);
        let handler = Counting::failing_once();
        let envelope = envelope();

        let first = consumer.consume(envelope.clone(), &handler).await;
        assert!(first.is_err());

        let redelivery = consumer.consume(envelope.clone(), &handler).await.unwrap();
        assert_eq!(redelivery, Disposition::Handled);

        let third = consumer.consume(envelope, &handler).await.unwrap();
        assert_eq!(third, Disposition::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_try_add_admits_exactly_one_caller() {
        let store = Arc::new(InMemoryInbox::default());
        let message_id = uuid::Uuid::now_v7();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
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
}
