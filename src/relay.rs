//! Relay loop delivering staged outbox rows through a transport.
//!
//! The relay:
//!
//! - Streams pending rows from an outbox backend
//! - Resolves each envelope's destination through the transport's topology
//! - Publishes and, once the broker acknowledges, settles the row
//! - Exposes lifecycle hooks for observability
//!
//! Publication happens before settlement, so a crash in between republishes
//! the row on the next pass; delivery is at-least-once and consumers absorb
//! the duplicates through the inbox. The loop runs until the stream ends, a
//! fatal error occurs, or the [`CancellationToken`] fires.

use std::sync::Arc;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::TransportMessage,
    outbox::{MarkDispatched, StreamPending},
    transport::{Transport, TransportError},
};

/// Outbox relay.
///
/// Continuously pulls pending rows from an outbox backend and delivers them
/// through a transport. Settled rows leave the pending set; a row whose
/// settlement races another relay instance is simply skipped.
pub struct OutboxRelay<D, T, HK = DefaultRelayHook> {
    outbox: D,
    transport: Arc<T>,
    hook: HK,
}

impl<D, T> OutboxRelay<D, T, DefaultRelayHook>
where
    D: StreamPending + MarkDispatched + Send,
    T: Transport,
{
    /// Create a relay with the default tracing hook.
    pub fn new(outbox: D, transport: Arc<T>) -> Self {
        Self {
            outbox,
            transport,
            hook: DefaultRelayHook,
        }
    }
}

impl<D, T, HK> OutboxRelay<D, T, HK>
where
    D: StreamPending + MarkDispatched + Send,
    <D as StreamPending>::Error: Into<tower::BoxError>,
    <D as MarkDispatched>::Error: Into<tower::BoxError>,
    D: MarkDispatched<ID = <D as StreamPending>::ID>,
    T: Transport + 'static,
    HK: RelayHook,
{
    /// Replace the relay hook while keeping everything else unchanged.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> OutboxRelay<D, T, HK2> {
        OutboxRelay {
            outbox: self.outbox,
            transport: self.transport,
            hook,
        }
    }

    /// Run the relay loop.
    ///
    /// Stops on cancellation, stream end, or fatal error. A publish failure is
    /// fatal (the row stays pending for the next run); a settlement failure is
    /// reported through the hook and the loop continues, since the worst case
    /// is a republish the consumer deduplicates.
    #[tracing::instrument(skip(self))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RelayRunError> {
        self.hook.on_startup();

        let mut pending = self
            .outbox
            .pending(cancel.clone())
            .await
            .map_err(|e| RelayRunError::outbox(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                message = pending.next() => {
                    match message {
                        Some(Ok(staged)) => {
                            self.hook.on_next_message(staged.envelope());

                            let envelope = staged.envelope().clone();
                            let destination = self
                                .transport
                                .topology()
                                .route_for(envelope.message_type());

                            match self.transport.publish(envelope, &destination).await {
                                Ok(()) => {
                                    self.hook.on_message_delivered(staged.envelope());
                                    if let Err(e) = self.outbox.mark_dispatched(vec![staged]).await {
                                        self.hook.on_mark_dispatched_error(e.into().as_ref());
                                    }
                                }
                                Err(e) => {
                                    self.hook.on_publish_error(&e);
                                    return Err(RelayRunError::transport(e));
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_stream_error(err.as_ref());
                            return Err(RelayRunError::outbox(err));
                        }
                        None => {
                            self.hook.on_stream_end();
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Error returned when the relay loop fails.
#[derive(Debug)]
pub struct RelayRunError {
    context: tracing_error::SpanTrace,
    kind: RelayRunErrorKind,
}

impl RelayRunError {
    fn transport(error: TransportError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayRunErrorKind::Transport(error),
        }
    }

    fn outbox(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayRunErrorKind::Outbox(error),
        }
    }

    pub fn kind(&self) -> &RelayRunErrorKind {
        &self.kind
    }
}

/// Classification of relay runtime errors.
#[derive(Debug)]
pub enum RelayRunErrorKind {
    /// Errors originating from the outbox backend.
    Outbox(tower::BoxError),
    /// Errors originating from the transport.
    Transport(TransportError),
}

impl std::fmt::Display for RelayRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayRunErrorKind::Outbox(err) => writeln!(f, "Outbox error: {}", err),
            RelayRunErrorKind::Transport(err) => writeln!(f, "Transport error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayRunErrorKind::Outbox(err) => Some(err.as_ref()),
            RelayRunErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks run synchronously on the relay task and should avoid heavy or
/// blocking work. Typical uses are logging and metrics.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_message(&self, envelope: &TransportMessage);
    fn on_stream_error(&self, error: &dyn std::error::Error);
    fn on_publish_error(&self, error: &dyn std::error::Error);
    fn on_message_delivered(&self, envelope: &TransportMessage);
    fn on_mark_dispatched_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
}

/// Default relay hook, logging lifecycle events through `tracing`.
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Relay is shutting down");
    }

    fn on_next_message(&self, envelope: &TransportMessage) {
        tracing::debug!(message_type = envelope.message_type(), "Pending message");
    }

    fn on_stream_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error streaming pending messages");
    }

    fn on_publish_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error publishing message");
    }

    fn on_message_delivered(&self, envelope: &TransportMessage) {
        tracing::info!(message_type = envelope.message_type(), "Message delivered");
    }

    fn on_mark_dispatched_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to settle dispatched message");
    }

    fn on_stream_end(&self) {
        tracing::info!("Pending stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::Identity,
        outbox::{StageMessages, inmemory::InMemoryOutbox},
        topology::TopologyRegistry,
        transport::InMemoryTransport,
    };

    fn envelope(message_type: &str) -> TransportMessage {
        TransportMessage::build(message_type, Identity::for_message()).finish()
    }

    #[tokio::test]
    async fn delivers_and_settles_staged_messages() {
        let outbox = InMemoryOutbox::default();
        outbox
            .stage_messages(vec![envelope("OrderPlaced"), envelope("OrderShipped")], &mut ())
            .await
            .unwrap();

        let transport = Arc::new(InMemoryTransport::new(TopologyRegistry::new()));
        let relay = OutboxRelay::new(outbox.clone(), transport.clone());

        relay.run(CancellationToken::new()).await.unwrap();

        assert_eq!(transport.publish_count("OrderPlaced").await, 1);
        assert_eq!(transport.publish_count("OrderShipped").await, 1);
        assert_eq!(outbox.pending_count().await, 0);
    }

    #[tokio::test]
    async fn resolves_destination_through_topology() {
        let outbox = InMemoryOutbox::default();
        outbox
            .stage_messages(vec![envelope("billing.OrderPlaced")], &mut ())
            .await
            .unwrap();

        let transport = Arc::new(InMemoryTransport::new(TopologyRegistry::new()));
        OutboxRelay::new(outbox, transport.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        // The simple-name rule routes "billing.OrderPlaced" to "OrderPlaced".
        let published = transport.published("OrderPlaced").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_type(), "billing.OrderPlaced");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let outbox = InMemoryOutbox::default();
        let transport = Arc::new(InMemoryTransport::new(TopologyRegistry::new()));
        let relay = OutboxRelay::new(outbox, transport);

        let cancel = CancellationToken::new();
        cancel.cancel();

        relay.run(cancel).await.unwrap();
    }
}
