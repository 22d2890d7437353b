//! Deferred-delivery ledger and polling dispatcher.
//!
//! "Publish this at time T" is decoupled from the broker call: producers
//! append a [`ScheduledMessage`] to a [`ScheduledStore`], and one or more
//! [`Dispatcher`] replicas poll for due messages and publish them. The
//! mark-dispatched step is an atomic conditional operation, so concurrent
//! replicas racing on one due message produce exactly one logical publish;
//! the losers observe a benign "already gone".

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{envelope::TransportMessage, transport::Transport};

pub use inmemory::InMemoryScheduledStore;

/// One entry of the deferred-delivery ledger.
///
/// Created by a producer requesting delayed delivery, pending while its
/// scheduled time lies in the future, eligible once due, and removed or
/// marked dispatched exactly once by whichever dispatcher wins the race.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScheduledMessage {
    /// Unique, sortable token identifying this scheduling request.
    pub token: Uuid,
    pub envelope: TransportMessage,
    pub scheduled_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    /// Absent until a dispatcher has published the message.
    pub dispatched_time: Option<DateTime<Utc>>,
}

impl ScheduledMessage {
    /// Schedule an envelope for delivery at an absolute time.
    pub fn at(envelope: TransportMessage, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::now_v7(),
            envelope,
            scheduled_time,
            created_time: Utc::now(),
            dispatched_time: None,
        }
    }

    /// Schedule an envelope for delivery after a delay from now.
    /// Schedule relative to now. Delays beyond the representable range clamp
    /// to the maximum timestamp rather than overflowing.
    pub fn after(envelope: TransportMessage, delay: Duration) -> Self {
        let scheduled_time = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::at(envelope, scheduled_time)
    }

    pub fn message_type(&self) -> &str {
        self.envelope.message_type()
    }
}

/// Storage backing for the deferred-delivery ledger.
#[async_trait::async_trait]
pub trait ScheduledStore: Send + Sync {
    /// Append a scheduling request to the ledger.
    async fn add(&self, message: ScheduledMessage) -> Result<(), SchedulerError>;

    /// Up to `batch_size` messages with `scheduled_time <= now`, ordered
    /// ascending by scheduled time, ties broken by token so results are
    /// deterministic. A future-scheduled message is never returned.
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ScheduledMessage>, SchedulerError>;

    /// Atomically mark or remove a dispatched message.
    ///
    /// Returns `true` when this caller performed the mark, `false` when the
    /// row was already gone (a benign race loss, never an error). Of N
    /// concurrent callers for one token, exactly one sees `true`.
    async fn mark_dispatched(&self, token: Uuid) -> Result<bool, SchedulerError>;
}

/// Polling relay publishing due messages through a [`Transport`].
///
/// Multiple replicas may run against one shared store; the conditional
/// mark-dispatched keeps the dispatch step single-publish per message.
/// A publish that succeeds right before a store failure is redelivered on a
/// later poll; consumers absorb the duplicate through the inbox.
pub struct Dispatcher<S, T, HK = DefaultDispatcherHook> {
    store: S,
    transport: T,
    poll_interval: Duration,
    batch_size: usize,
    hook: HK,
}

impl<S, T> Dispatcher<S, T, DefaultDispatcherHook>
where
    S: ScheduledStore,
    T: Transport,
{
    pub fn new(store: S, transport: T, poll_interval: Duration) -> Self {
        Self {
            store,
            transport,
            poll_interval,
            batch_size: 100,
            hook: DefaultDispatcherHook,
        }
    }
}

impl<S, T, HK> Dispatcher<S, T, HK>
where
    S: ScheduledStore,
    T: Transport,
    HK: DispatcherHook,
{
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace the lifecycle hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatcherHook>(self, hook: HK2) -> Dispatcher<S, T, HK2> {
        Dispatcher {
            store: self.store,
            transport: self.transport,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            hook,
        }
    }

    /// Run the polling loop until the token is cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        self.hook.on_startup();
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.poll_once(Utc::now()).await?;
                }
            }
        }
    }

    /// One poll pass: fetch due messages, publish, mark dispatched.
    ///
    /// Exposed separately so replicas and tests can drive polling directly.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let due = self.store.get_due(now, self.batch_size).await?;

        for message in due {
            self.hook.on_due_message(&message);

            // Publish first, then mark: a crash in between redelivers the
            // message later, and the inbox absorbs the duplicate downstream.
            let destination = self
                .transport
                .topology()
                .route_for(message.message_type());
            match self
                .transport
                .publish(message.envelope.clone(), &destination)
                .await
            {
                Ok(()) => match self.store.mark_dispatched(message.token).await {
                    Ok(true) => self.hook.on_dispatched(&message),
                    Ok(false) => self.hook.on_race_lost(&message),
                    Err(err) => self.hook.on_store_error(&err),
                },
                Err(err) => {
                    self.hook.on_publish_error(&err);
                }
            }
        }

        Ok(())
    }
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait DispatcherHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_due_message(&self, message: &ScheduledMessage);
    fn on_dispatched(&self, message: &ScheduledMessage);
    fn on_race_lost(&self, message: &ScheduledMessage);
    fn on_publish_error(&self, error: &dyn std::error::Error);
    fn on_store_error(&self, error: &dyn std::error::Error);
}

/// Default dispatcher hook, logging lifecycle events with `tracing`.
pub struct DefaultDispatcherHook;

impl DispatcherHook for DefaultDispatcherHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_due_message(&self, message: &ScheduledMessage) {
        tracing::debug!(token = %message.token, "Scheduled message due");
    }

    fn on_dispatched(&self, message: &ScheduledMessage) {
        tracing::info!(token = %message.token, "Scheduled message dispatched");
    }

    fn on_race_lost(&self, message: &ScheduledMessage) {
        tracing::debug!(token = %message.token, "Another dispatcher won the race");
    }

    fn on_publish_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to publish scheduled message");
    }

    fn on_store_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to mark scheduled message dispatched");
    }
}

/// Error returned by scheduler operations.
#[derive(Debug)]
pub struct SchedulerError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl SchedulerError {
    /// Create a backend-related scheduler error.
    pub fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        envelope::{Identity, TransportMessage},
        topology::TopologyRegistry,
        transport::InMemoryTransport,
    };

    fn envelope(message_type: &str) -> TransportMessage {
        TransportMessage::build(message_type, Identity::for_message()).finish()
    }

    #[tokio::test]
    async fn due_messages_are_published_and_marked() {
        let store = InMemoryScheduledStore::default();
        let transport = InMemoryTransport::new(TopologyRegistry::new());
        let now = Utc::now();

        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now - chrono::Duration::minutes(1),
            ))
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), Duration::from_secs(1));
        dispatcher.poll_once(now).await.unwrap();

        assert_eq!(transport.publish_count("ReminderDue").await, 1);
        assert!(store.get_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_messages_stay_pending() {
        let store = InMemoryScheduledStore::default();
        let transport = InMemoryTransport::new(TopologyRegistry::new());
        let now = Utc::now();

        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now + chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), Duration::from_secs(1));
        dispatcher.poll_once(now).await.unwrap();

        assert_eq!(transport.publish_count("ReminderDue").await, 0);
    }

    #[tokio::test]
    async fn past_and_future_mix_dispatches_only_the_due_ones() {
        let store = InMemoryScheduledStore::default();
        let transport = InMemoryTransport::new(TopologyRegistry::new());
        let now = Utc::now();

        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now - chrono::Duration::minutes(2),
            ))
            .await
            .unwrap();
        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now - chrono::Duration::minutes(1),
            ))
            .await
            .unwrap();
        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now + chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();

        let due = store.get_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].scheduled_time < due[1].scheduled_time);

        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), Duration::from_secs(1));
        dispatcher.poll_once(now).await.unwrap();

        assert_eq!(transport.publish_count("ReminderDue").await, 2);
    }

    #[tokio::test]
    async fn racing_dispatchers_publish_exactly_once_logically() {
        // Two replicas share one store; whichever loses the conditional mark
        // reports a benign race loss. The transport may see the publish from
        // both replicas of this poll pass only if both fetched before either
        // marked; driving the marks through poll_once serializes per replica,
        // so we race the marks directly.
        let store = Arc::new(InMemoryScheduledStore::default());
        let message = ScheduledMessage::at(
            envelope("ReminderDue"),
            Utc::now() - chrono::Duration::minutes(1),
        );
        let token = message.token;
        store.add(message).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.mark_dispatched(token).await.unwrap() })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.mark_dispatched(token).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one replica must win the mark");
    }

    #[test]
    fn oversized_delays_clamp_to_the_maximum_timestamp() {
        let message = ScheduledMessage::after(
            envelope("ReminderDue"),
            Duration::from_secs(u64::MAX),
        );
        assert_eq!(message.scheduled_time, DateTime::<Utc>::MAX_UTC);
    }

    struct CountingHook {
        dispatched: Arc<std::sync::atomic::AtomicU32>,
        race_lost: Arc<std::sync::atomic::AtomicU32>,
    }

    impl DispatcherHook for CountingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_due_message(&self, _message: &ScheduledMessage) {}
        fn on_dispatched(&self, _message: &ScheduledMessage) {
            self.dispatched
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn on_race_lost(&self, _message: &ScheduledMessage) {
            self.race_lost
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn on_publish_error(&self, _error: &dyn std::error::Error) {}
        fn on_store_error(&self, _error: &dyn std::error::Error) {}
    }

    #[tokio::test]
    async fn concurrent_replicas_dispatch_each_message_logically_once() {
        let store = InMemoryScheduledStore::default();
        let transport = InMemoryTransport::new(TopologyRegistry::new());
        let now = Utc::now();

        store
            .add(ScheduledMessage::at(
                envelope("ReminderDue"),
                now - chrono::Duration::minutes(1),
            ))
            .await
            .unwrap();

        let dispatched = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let race_lost = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut replicas = Vec::new();
        for _ in 0..2 {
            let dispatcher =
                Dispatcher::new(store.clone(), transport.clone(), Duration::from_secs(1))
                    .with_hook(CountingHook {
                        dispatched: Arc::clone(&dispatched),
                        race_lost: Arc::clone(&race_lost),
                    });
            replicas.push(tokio::spawn(
                async move { dispatcher.poll_once(now).await },
            ));
        }
        for replica in replicas {
            replica.await.unwrap().unwrap();
        }

        // One replica wins the mark; the other either polled an empty batch
        // or lost the conditional mark, which is benign and not an error.
        assert_eq!(dispatched.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(race_lost.load(std::sync::atomic::Ordering::SeqCst) <= 1);
        assert!(store.get_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let store = InMemoryScheduledStore::default();
        let transport = InMemoryTransport::new(TopologyRegistry::new());
        let dispatcher = Dispatcher::new(store, transport, Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
    }
}
