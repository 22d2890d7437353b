use std::time::Duration;

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Headers as _, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    ClientConfig, Message as _,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    envelope::{Identity, TransportMessage},
    topology::{self, TopologyRegistry},
    transport::{
        Credentials, HandlerRegistration, HostSettings, Transport, TransportError, ATTEMPT_HEADER,
        DEAD_LETTER_SUFFIX,
    },
};

const MESSAGE_TYPE_HEADER: &str = "transponder-message-type";
const MESSAGE_ID_HEADER: &str = "transponder-message-id";
const CORRELATION_HEADER: &str = "transponder-correlation-id";
const CONVERSATION_HEADER: &str = "transponder-conversation-id";
const CONTENT_TYPE_HEADER: &str = "transponder-content-type";
const SENT_TIME_HEADER: &str = "transponder-sent-time";

/// Kafka broker binding.
///
/// Publishes through a `FutureProducer`; the message key is the message id so
/// messages sharing an id land on one partition. Envelope metadata travels as
/// Kafka record headers. Consumption uses a `StreamConsumer` per subscription
/// with manual commits: a record is only committed after the handler outcome
/// is settled.
pub struct KafkaTransport {
    producer: FutureProducer,
    timeout: Duration,
    settings: HostSettings,
    topology: TopologyRegistry,
    max_delivery_attempts: u32,
}

impl KafkaTransport {
    pub fn new(
        producer: FutureProducer,
        settings: HostSettings,
        topology: TopologyRegistry,
    ) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
            settings,
            topology,
            max_delivery_attempts: 5,
        }
    }

    /// Set a custom timeout for sends (default 5 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the poison budget (default 5 attempts).
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    fn bootstrap_servers(&self) -> &str {
        match self.settings.credentials() {
            Credentials::ConnectionString(servers) => servers,
            Credentials::Namespace { namespace, .. } => namespace,
        }
    }

    async fn produce(
        producer: &FutureProducer,
        timeout: Duration,
        topic: &str,
        envelope: &TransportMessage,
    ) -> Result<(), rdkafka::error::KafkaError> {
        let key = envelope
            .identity()
            .message_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        let record = FutureRecord::to(topic)
            .payload(envelope.body())
            .key(&key)
            .headers(headers_for(envelope));

        producer
            .send(record, timeout)
            .await
            .map_err(|(e, _)| e)?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for KafkaTransport {
    #[tracing::instrument(skip_all, fields(destination))]
    async fn publish(
        &self,
        envelope: TransportMessage,
        destination: &str,
    ) -> Result<(), TransportError> {
        self.settings
            .retry()
            .run(|| Self::produce(&self.producer, self.timeout, destination, &envelope))
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
        let topic = topology::queue_from_address(address);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("group.id", registration.consumer())
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| TransportError::broker(Box::new(e)))?;
        consumer
            .subscribe(&[&topic])
            .map_err(|e| TransportError::broker(Box::new(e)))?;

        let producer = self.producer.clone();
        let timeout = self.timeout;
        let max_attempts = self.max_delivery_attempts;
        let fallback_type = registration.message_type().to_owned();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = consumer.recv() => match message {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::error!(%err, "consume error");
                            continue;
                        }
                    },
                };

                let envelope = decode_record(&message, &fallback_type);
                let attempt = envelope
                    .header(ATTEMPT_HEADER)
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(1);

                match registration.handler().handle(envelope.clone()).await {
                    Ok(()) => {}
                    Err(err) if attempt < max_attempts => {
                        tracing::warn!(%err, attempt, topic, "handler failed, redelivering");
                        let retry =
                            envelope.with_header(ATTEMPT_HEADER, (attempt + 1).to_string());
                        if let Err(err) = Self::produce(&producer, timeout, &topic, &retry).await {
                            tracing::error!(%err, "failed to republish for retry");
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, topic, "poison budget exhausted, dead-lettering");
                        let dead_letter = format!("{topic}{DEAD_LETTER_SUFFIX}");
                        if let Err(err) =
                            Self::produce(&producer, timeout, &dead_letter, &envelope).await
                        {
                            tracing::error!(%err, "failed to dead-letter record");
                        }
                    }
                }

                // Commit unconditionally; retries travel as fresh records
                // carrying the attempt header.
                if let Err(err) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::error!(%err, "failed to commit offset");
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

fn headers_for(envelope: &TransportMessage) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in envelope.headers() {
        headers = headers.insert(Header {
            key,
            value: Some(value.as_bytes()),
        });
    }

    let identity = envelope.identity();
    if let Some(message_id) = identity.message_id {
        headers = headers.insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id.to_string().as_bytes()),
        });
    }
    if let Some(correlation_id) = identity.correlation_id {
        headers = headers.insert(Header {
            key: CORRELATION_HEADER,
            value: Some(correlation_id.to_string().as_bytes()),
        });
    }
    if let Some(conversation_id) = identity.conversation_id {
        headers = headers.insert(Header {
            key: CONVERSATION_HEADER,
            value: Some(conversation_id.to_string().as_bytes()),
        });
    }
    headers = headers.insert(Header {
        key: MESSAGE_TYPE_HEADER,
        value: Some(envelope.message_type().as_bytes()),
    });
    if let Some(content_type) = envelope.content_type() {
        headers = headers.insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(content_type.as_bytes()),
        });
    }
    if let Some(sent_time) = envelope.sent_time() {
        headers = headers.insert(Header {
            key: SENT_TIME_HEADER,
            value: Some(sent_time.to_rfc3339().as_bytes()),
        });
    }

    headers
}

fn decode_record(
    message: &rdkafka::message::BorrowedMessage<'_>,
    fallback_type: &str,
) -> TransportMessage {
    let mut identity = Identity::empty();
    let mut message_type = None;
    let mut content_type = None;
    let mut sent_time = None;
    let mut plain_headers = Vec::new();

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let Some(value) = header.value else { continue };
            let value = String::from_utf8_lossy(value).into_owned();
            match header.key {
                MESSAGE_ID_HEADER => identity.message_id = Uuid::parse_str(&value).ok(),
                CORRELATION_HEADER => identity.correlation_id = Uuid::parse_str(&value).ok(),
                CONVERSATION_HEADER => identity.conversation_id = Uuid::parse_str(&value).ok(),
                MESSAGE_TYPE_HEADER => message_type = Some(value),
                CONTENT_TYPE_HEADER => content_type = Some(value),
                SENT_TIME_HEADER => {
                    sent_time = chrono::DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|t| t.with_timezone(&chrono::Utc));
                }
                key => plain_headers.push((key.to_owned(), value)),
            }
        }
    }

    let message_type = message_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback_type.to_owned());

    let mut builder = TransportMessage::build(message_type, identity)
        .body(message.payload().unwrap_or_default().to_vec());
    for (key, value) in plain_headers {
        builder = builder.header(key, value);
    }
    if let Some(content_type) = content_type {
        builder = builder.content_type(content_type);
    }
    if let Some(sent_time) = sent_time {
        builder = builder.sent_time(sent_time);
    }

    builder.finish()
}
