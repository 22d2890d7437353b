use std::sync::Arc;

use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    envelope::{Identity, TransportMessage},
    topology::{self, TopologyRegistry},
    transport::{
        HandlerRegistration, HostSettings, Transport, TransportError, ATTEMPT_HEADER,
        DEAD_LETTER_SUFFIX,
    },
};

const CONVERSATION_HEADER: &str = "transponder-conversation-id";

/// RabbitMQ broker binding.
///
/// Publishes through a shared `lapin::Channel` (the channel is not `Sync`,
/// hence the mutex) and waits for publisher confirms, so a publish only
/// returns once the broker has acknowledged the message. Transient publish
/// faults are retried per the host settings' retry policy.
///
/// Consumption acks on handler success. On handler failure the delivery is
/// republished with an incremented attempt header until the poison budget is
/// exhausted, then routed to `<queue>.dead-letter`.
pub struct RabbitMqTransport {
    channel: Arc<Mutex<lapin::Channel>>,
    exchange: String,
    settings: HostSettings,
    topology: TopologyRegistry,
    max_delivery_attempts: u32,
}

impl RabbitMqTransport {
    /// Create the binding, putting the channel into publisher-confirm mode.
    ///
    /// Without confirm mode the confirmation returned by `basic_publish`
    /// resolves as `NotRequested` with no broker round-trip, and a publish
    /// would report success before any acknowledgement exists. Enabling it
    /// here keeps that precondition out of the callers' hands; a channel
    /// that cannot enter confirm mode fails construction.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(
        channel: lapin::Channel,
        exchange: impl Into<String>,
        settings: HostSettings,
        topology: TopologyRegistry,
    ) -> Result<Self, TransportError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::broker(Box::new(e)))?;

        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
            settings,
            topology,
            max_delivery_attempts: 5,
        })
    }

    /// Override the poison budget (default 5 attempts).
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    async fn basic_publish(
        channel: &Arc<Mutex<lapin::Channel>>,
        exchange: &str,
        routing_key: &str,
        envelope: &TransportMessage,
    ) -> Result<(), lapin::Error> {
        let properties = properties_for(envelope);
        let channel = channel.lock().await;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                envelope.body(),
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for RabbitMqTransport {
    #[tracing::instrument(skip_all, fields(destination))]
    async fn publish(
        &self,
        envelope: TransportMessage,
        destination: &str,
    ) -> Result<(), TransportError> {
        self.settings
            .retry()
            .run(|| Self::basic_publish(&self.channel, &self.exchange, destination, &envelope))
            .await
            .map_err(|e| TransportError::broker(Box::new(e)))
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    async fn subscribe(
        &self,
        registration: HandlerRegistration,
        address: &Url,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let queue = topology::queue_from_address(address);

        let mut consumer = {
            let channel = self.channel.lock().await;
            channel
                .basic_consume(
                    &queue,
                    registration.consumer(),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::broker(Box::new(e)))?
        };

        let channel = Arc::clone(&self.channel);
        let max_attempts = self.max_delivery_attempts;
        let fallback_type = registration.message_type().to_owned();

        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(err)) => {
                            tracing::error!(%err, "consume error");
                            continue;
                        }
                        None => break,
                    },
                };

                let envelope = decode_delivery(&delivery, &fallback_type);
                let attempt = envelope
                    .header(ATTEMPT_HEADER)
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(1);

                match registration.handler().handle(envelope.clone()).await {
                    Ok(()) => {}
                    Err(err) if attempt < max_attempts => {
                        tracing::warn!(%err, attempt, queue, "handler failed, redelivering");
                        let retry =
                            envelope.with_header(ATTEMPT_HEADER, (attempt + 1).to_string());
                        if let Err(err) =
                            Self::basic_publish(&channel, "", &queue, &retry).await
                        {
                            tracing::error!(%err, "failed to republish for retry");
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, queue, "poison budget exhausted, dead-lettering");
                        let dead_letter = format!("{queue}{DEAD_LETTER_SUFFIX}");
                        if let Err(err) =
                            Self::basic_publish(&channel, "", &dead_letter, &envelope).await
                        {
                            tracing::error!(%err, "failed to dead-letter delivery");
                        }
                    }
                }

                // The original delivery is always settled; retries travel as
                // fresh publishes carrying the attempt header.
                if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                    tracing::error!(%err, "failed to ack delivery");
                }
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

fn properties_for(envelope: &TransportMessage) -> BasicProperties {
    let mut table = FieldTable::default();
    for (key, value) in envelope.headers() {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    if let Some(conversation_id) = envelope.identity().conversation_id {
        table.insert(
            ShortString::from(CONVERSATION_HEADER),
            AMQPValue::LongString(conversation_id.to_string().into()),
        );
    }

    let mut properties = BasicProperties::default()
        .with_headers(table)
        .with_kind(ShortString::from(envelope.message_type()));

    if let Some(message_id) = envelope.identity().message_id {
        properties = properties.with_message_id(ShortString::from(message_id.to_string()));
    }
    if let Some(correlation_id) = envelope.identity().correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.to_string()));
    }
    if let Some(content_type) = envelope.content_type() {
        properties = properties.with_content_type(ShortString::from(content_type));
    }
    if let Some(sent_time) = envelope.sent_time() {
        properties = properties.with_timestamp(sent_time.timestamp().max(0) as u64);
    }

    properties
}

fn decode_delivery(delivery: &lapin::message::Delivery, fallback_type: &str) -> TransportMessage {
    let properties = &delivery.properties;

    let mut identity = Identity::empty();
    identity.message_id = properties
        .message_id()
        .as_ref()
        .and_then(|s| Uuid::parse_str(s.as_str()).ok());
    identity.correlation_id = properties
        .correlation_id()
        .as_ref()
        .and_then(|s| Uuid::parse_str(s.as_str()).ok());

    let mut headers = Vec::new();
    if let Some(table) = properties.headers().as_ref() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                let value = String::from_utf8_lossy(s.as_bytes()).into_owned();
                if key.as_str() == CONVERSATION_HEADER {
                    identity.conversation_id = Uuid::parse_str(&value).ok();
                } else {
                    headers.push((key.as_str().to_owned(), value));
                }
            }
        }
    }

    let message_type = properties
        .kind()
        .as_ref()
        .map(|s| s.as_str().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_type.to_owned());

    let mut builder =
        TransportMessage::build(message_type, identity).body(delivery.data.clone());
    for (key, value) in headers {
        builder = builder.header(key, value);
    }
    if let Some(content_type) = properties.content_type().as_ref() {
        builder = builder.content_type(content_type.as_str());
    }
    if let Some(timestamp) = properties.timestamp() {
        if let Some(sent) = chrono::DateTime::from_timestamp(*timestamp as i64, 0) {
            builder = builder.sent_time(sent);
        }
    }

    builder.finish()
}
