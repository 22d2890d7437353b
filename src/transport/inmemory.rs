use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    envelope::TransportMessage,
    topology::{self, TopologyRegistry},
    transport::{
        HandlerRegistration, HostSettings, Transport, TransportError, ATTEMPT_HEADER,
        DEAD_LETTER_SUFFIX,
    },
};

/// In-memory transport for testing or local pipelines.
///
/// Publishing records the envelope per destination and delivers it inline to
/// every handler registered for that destination. A failing handler is
/// redelivered up to the poison budget, then the envelope is moved to the
/// dead-letter ledger.
#[derive(Clone)]
pub struct InMemoryTransport {
    settings: HostSettings,
    topology: TopologyRegistry,
    state: Arc<Mutex<State>>,
    max_delivery_attempts: u32,
}

#[derive(Default)]
struct State {
    published: HashMap<String, Vec<TransportMessage>>,
    // Keyed per subscription so cancelling one does not unregister another
    // that happens to share a consumer name.
    handlers: HashMap<String, Vec<(Uuid, HandlerRegistration)>>,
    dead_letters: Vec<TransportMessage>,
}

impl InMemoryTransport {
    pub fn new(topology: TopologyRegistry) -> Self {
        // The local address is always valid; construction cannot fail.
        let address = Url::parse("inmemory://local").unwrap();
        let settings = HostSettings::builder(address)
            .connection_string("inmemory://local")
            .build()
            .unwrap();

        Self {
            settings,
            topology,
            state: Arc::new(Mutex::new(State::default())),
            max_delivery_attempts: 3,
        }
    }

    /// Override the poison budget (default 3 attempts).
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    /// Envelopes published to a destination, in publish order.
    pub async fn published(&self, destination: &str) -> Vec<TransportMessage> {
        self.state
            .lock()
            .await
            .published
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of envelopes published to a destination.
    pub async fn publish_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .await
            .published
            .get(destination)
            .map_or(0, Vec::len)
    }

    /// Envelopes that exhausted their poison budget.
    pub async fn dead_letters(&self) -> Vec<TransportMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    async fn deliver(&self, envelope: TransportMessage, registrations: Vec<HandlerRegistration>) {
        for registration in registrations {
            let mut attempt = 1;
            loop {
                let delivery = envelope.with_header(ATTEMPT_HEADER, attempt.to_string());
                match registration.handler().handle(delivery).await {
                    Ok(()) => break,
                    Err(err) if attempt < self.max_delivery_attempts => {
                        tracing::warn!(
                            %err,
                            attempt,
                            consumer = registration.consumer(),
                            "handler failed, redelivering",
                        );
                        attempt += 1;
                    }
                    Err(err) => {
                        tracing::error!(
                            %err,
                            consumer = registration.consumer(),
                            "poison budget exhausted, dead-lettering",
                        );
                        self.state.lock().await.dead_letters.push(envelope.clone());
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    #[tracing::instrument(skip_all, fields(destination))]
    async fn publish(
        &self,
        envelope: TransportMessage,
        destination: &str,
    ) -> Result<(), TransportError> {
        let registrations: Vec<_> = {
            let mut state = self.state.lock().await;
            state
                .published
                .entry(destination.to_owned())
                .or_default()
                .push(envelope.clone());
            state
                .handlers
                .get(destination)
                .map(|subscriptions| {
                    subscriptions
                        .iter()
                        .map(|(_, registration)| registration.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        self.deliver(envelope, registrations).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    async fn subscribe(
        &self,
        registration: HandlerRegistration,
        address: &Url,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let destination = topology::queue_from_address(address);
        let subscription_id = Uuid::now_v7();

        self.state
            .lock()
            .await
            .handlers
            .entry(destination.clone())
            .or_default()
            .push((subscription_id, registration));

        // Unregister this subscription once it is cancelled.
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut state = state.lock().await;
            if let Some(registrations) = state.handlers.get_mut(&destination) {
                registrations.retain(|(id, _)| *id != subscription_id);
            }
        });

        Ok(())
    }

    fn host_settings(&self) -> &HostSettings {
        &self.settings
    }

    fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }
}

/// The in-memory dead-letter destination for a queue name.
pub fn dead_letter_destination(destination: &str) -> String {
    format!("{destination}{DEAD_LETTER_SUFFIX}")
}
