//! Producer-facing send surface.
//!
//! One facade over the three ways an envelope leaves a producer:
//!
//! - [`MessageSender::send`]: immediate, straight to the transport
//! - [`MessageSender::send_at`] / [`MessageSender::send_after`]: delayed,
//!   through the scheduled store for a dispatcher to publish when due
//! - [`MessageSender::stage`]: transactional, through the outbox for the
//!   relay to publish after the unit of work commits

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    envelope::TransportMessage,
    outbox::{Outbox, OutboxError, StageMessages},
    scheduler::{ScheduledMessage, ScheduledStore, SchedulerError},
    transport::{Transport, TransportError},
};

/// Facade routing envelopes to the transport, the scheduled store, or the
/// outbox depending on how the producer wants them delivered.
pub struct MessageSender<T, S, D> {
    transport: Arc<T>,
    scheduled: S,
    outbox: Outbox<D>,
}

impl<T, S, D> MessageSender<T, S, D>
where
    T: Transport,
    S: ScheduledStore,
    D: Clone,
{
    pub fn new(transport: Arc<T>, scheduled: S, outbox: Outbox<D>) -> Self {
        Self {
            transport,
            scheduled,
            outbox,
        }
    }

    /// Publish immediately, resolving the destination from the envelope's
    /// message type through the transport's topology.
    #[tracing::instrument(skip_all, fields(message_type = envelope.message_type()))]
    pub async fn send(&self, envelope: TransportMessage) -> Result<(), SendError> {
        let destination = self.transport.topology().route_for(envelope.message_type());
        self.send_to(envelope, &destination).await
    }

    /// Publish immediately to an explicit destination, bypassing topology.
    pub async fn send_to(
        &self,
        envelope: TransportMessage,
        destination: &str,
    ) -> Result<(), SendError> {
        self.transport
            .publish(envelope, destination)
            .await
            .map_err(SendError::transport)
    }

    /// Schedule delivery for a point in time. Returns the scheduling token.
    #[tracing::instrument(skip_all, fields(message_type = envelope.message_type(), %scheduled_time))]
    pub async fn send_at(
        &self,
        envelope: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<Uuid, SendError> {
        let message = ScheduledMessage::at(envelope, scheduled_time);
        let token = message.token;
        self.scheduled
            .add(message)
            .await
            .map_err(SendError::scheduler)?;
        Ok(token)
    }

    /// Schedule delivery after a delay. Returns the scheduling token.
    pub async fn send_after(
        &self,
        envelope: TransportMessage,
        delay: Duration,
    ) -> Result<Uuid, SendError> {
        let message = ScheduledMessage::after(envelope, delay);
        let token = message.token;
        self.scheduled
            .add(message)
            .await
            .map_err(SendError::scheduler)?;
        Ok(token)
    }

    /// Cancel a scheduled delivery by its token.
    ///
    /// Returns `false` when the token is unknown or the dispatcher already
    /// won the race and published it.
    pub async fn cancel_scheduled(&self, token: Uuid) -> Result<bool, SendError> {
        self.scheduled
            .mark_dispatched(token)
            .await
            .map_err(SendError::scheduler)
    }

    /// Stage envelopes in the caller's transaction for post-commit delivery.
    ///
    /// Nothing reaches the broker here; the relay publishes once the
    /// transaction commits, and a rollback discards the envelopes.
    pub async fn stage(
        &self,
        envelopes: impl IntoIterator<Item = TransportMessage>,
        tx: &mut D::Transaction<'_>,
    ) -> Result<(), SendError>
    where
        D: StageMessages,
        <D as StageMessages>::Error: Into<tower::BoxError>,
    {
        self.outbox
            .stage(envelopes, tx)
            .await
            .map_err(SendError::outbox)
    }
}

/// Error returned by [`MessageSender`] operations.
#[derive(Debug)]
pub struct SendError {
    context: SpanTrace,
    kind: SendErrorKind,
}

/// Classification of send errors by the surface that failed.
#[derive(Debug)]
pub enum SendErrorKind {
    Transport(TransportError),
    Scheduler(SchedulerError),
    Outbox(OutboxError),
}

impl SendError {
    fn transport(err: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Transport(err),
        }
    }

    fn scheduler(err: SchedulerError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Scheduler(err),
        }
    }

    fn outbox(err: OutboxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Outbox(err),
        }
    }

    pub fn kind(&self) -> &SendErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SendErrorKind::Transport(err) => writeln!(f, "Transport error: {}", err),
            SendErrorKind::Scheduler(err) => writeln!(f, "Scheduler error: {}", err),
            SendErrorKind::Outbox(err) => writeln!(f, "Outbox error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SendErrorKind::Transport(err) => Some(err),
            SendErrorKind::Scheduler(err) => Some(err),
            SendErrorKind::Outbox(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        envelope::Identity,
        outbox::inmemory::InMemoryOutbox,
        relay::OutboxRelay,
        scheduler::inmemory::InMemoryScheduledStore,
        topology::TopologyRegistry,
        transport::InMemoryTransport,
    };

    fn sender() -> (
        MessageSender<InMemoryTransport, InMemoryScheduledStore, InMemoryOutbox>,
        Arc<InMemoryTransport>,
        InMemoryScheduledStore,
        InMemoryOutbox,
    ) {
        let transport = Arc::new(InMemoryTransport::new(TopologyRegistry::new()));
        let scheduled = InMemoryScheduledStore::default();
        let outbox = InMemoryOutbox::default();
        let sender = MessageSender::new(transport.clone(), scheduled.clone(), Outbox::new(outbox.clone()));
        (sender, transport, scheduled, outbox)
    }

    fn envelope(message_type: &str) -> TransportMessage {
        TransportMessage::build(message_type, Identity::for_message()).finish()
    }

    #[tokio::test]
    async fn send_publishes_immediately() {
        let (sender, transport, _, _) = sender();

        sender.send(envelope("OrderPlaced")).await.unwrap();

        assert_eq!(transport.publish_count("OrderPlaced").await, 1);
    }

    #[tokio::test]
    async fn delayed_send_goes_to_the_scheduled_store() {
        let (sender, transport, scheduled, _) = sender();

        let token = sender
            .send_after(envelope("ReminderDue"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(transport.publish_count("ReminderDue").await, 0);
        let due = scheduled
            .get_due(Utc::now() + chrono::Duration::minutes(2), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].token, token);
    }

    #[tokio::test]
    async fn cancel_scheduled_prevents_dispatch() {
        let (sender, _, scheduled, _) = sender();

        let token = sender
            .send_after(envelope("ReminderDue"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(sender.cancel_scheduled(token).await.unwrap());
        assert!(!sender.cancel_scheduled(token).await.unwrap());

        let due = scheduled
            .get_due(Utc::now() + chrono::Duration::minutes(2), 10)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn staged_envelopes_reach_the_broker_through_the_relay() {
        let (sender, transport, _, outbox) = sender();

        sender
            .stage(vec![envelope("OrderPlaced")], &mut ())
            .await
            .unwrap();
        assert_eq!(transport.publish_count("OrderPlaced").await, 0);

        OutboxRelay::new(outbox, transport.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.publish_count("OrderPlaced").await, 1);
    }
}
