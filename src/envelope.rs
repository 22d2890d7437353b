//! Transport-agnostic message representation.
//!
//! Every component downstream of a producer depends only on
//! [`TransportMessage`], never on a broker-specific message type. The envelope
//! is immutable after construction; mutation happens by building a new one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifiers threading a message to its origin, its causal
/// chain, and its long-running exchange.
///
/// Each field is independently optional. An absent field never blocks a
/// publish; it only disables the correlation feature that depends on it.
/// Identifiers are UUIDv7 so they sort by creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique id of this message, used for inbox deduplication.
    pub message_id: Option<Uuid>,
    /// Id shared by every message in one causal chain.
    pub correlation_id: Option<Uuid>,
    /// Id of the long-running exchange this message belongs to.
    pub conversation_id: Option<Uuid>,
}

impl Identity {
    /// An identity with no identifiers set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// An identity with a fresh, sortable message id.
    pub fn for_message() -> Self {
        Self {
            message_id: Some(Uuid::now_v7()),
            correlation_id: None,
            conversation_id: None,
        }
    }

    /// Set the correlation id.
    pub fn correlated_with(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the conversation id.
    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// The identifier used to keep related messages on one outbox partition:
    /// the conversation id when present, otherwise the message id.
    pub fn partition_id(&self) -> Option<Uuid> {
        self.conversation_id.or(self.message_id)
    }
}

/// Immutable message envelope.
///
/// Bundles a byte body with its content type, a case-insensitive header map,
/// the message [`Identity`], the message type name and an optional sent
/// timestamp. An `Identity` value is always present (its individual fields
/// may all be empty); construction without one is unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    identity: Identity,
    message_type: String,
    body: Vec<u8>,
    content_type: Option<String>,
    headers: HashMap<String, String>,
    sent_time: Option<DateTime<Utc>>,
}

impl TransportMessage {
    /// Start building an envelope for the given message type.
    ///
    /// Panics if `message_type` is empty; an unnamed message is a programming
    /// error, not a recoverable condition.
    pub fn build(message_type: impl Into<String>, identity: Identity) -> TransportMessageBuilder {
        let message_type = message_type.into();
        assert!(!message_type.is_empty(), "message type must not be empty");
        TransportMessageBuilder {
            message: TransportMessage {
                identity,
                message_type,
                body: Vec::new(),
                content_type: None,
                headers: HashMap::new(),
                sent_time: None,
            },
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn sent_time(&self) -> Option<DateTime<Utc>> {
        self.sent_time
    }

    /// Look up a header. Keys are case-insensitive.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, keyed by their lowercased names.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Copy of this envelope with one header replaced.
    ///
    /// The envelope itself stays immutable; transports use this to stamp
    /// delivery metadata (e.g. an attempt counter) on redelivery.
    pub fn with_header(&self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        copy
    }
}

/// Builder for [`TransportMessage`].
///
/// The message type and identity are fixed at [`TransportMessage::build`];
/// everything else is optional.
pub struct TransportMessageBuilder {
    message: TransportMessage,
}

impl TransportMessageBuilder {
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.message.body = body;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.message.content_type = Some(content_type.into());
        self
    }

    /// Add a header. Keys are lowercased on insertion so lookups are
    /// case-insensitive and insertion order is irrelevant.
    pub fn header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.message
            .headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn sent_time(mut self, sent_time: DateTime<Utc>) -> Self {
        self.message.sent_time = Some(sent_time);
        self
    }

    /// Stamp the current time as the sent timestamp.
    pub fn sent_now(mut self) -> Self {
        self.message.sent_time = Some(Utc::now());
        self
    }

    pub fn finish(self) -> TransportMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let envelope = TransportMessage::build("OrderPlaced", Identity::for_message())
            .header("Correlation-Source", "gateway")
            .finish();

        assert_eq!(envelope.header("correlation-source"), Some("gateway"));
        assert_eq!(envelope.header("CORRELATION-SOURCE"), Some("gateway"));
        assert_eq!(envelope.header("missing"), None);
    }

    #[test]
    fn identity_fields_are_independently_optional() {
        let identity = Identity::empty();
        assert!(identity.message_id.is_none());
        assert!(identity.correlation_id.is_none());
        assert!(identity.conversation_id.is_none());

        let envelope = TransportMessage::build("OrderPlaced", identity).finish();
        assert!(envelope.identity().message_id.is_none());
    }

    #[test]
    fn message_ids_sort_by_creation() {
        let first = Identity::for_message().message_id.unwrap();
        let second = Identity::for_message().message_id.unwrap();
        assert!(first <= second);
    }

    #[test]
    fn partition_id_prefers_conversation() {
        let conversation = Uuid::now_v7();
        let identity = Identity::for_message().in_conversation(conversation);
        assert_eq!(identity.partition_id(), Some(conversation));

        let identity = Identity::for_message();
        assert_eq!(identity.partition_id(), identity.message_id);
    }

    #[test]
    #[should_panic(expected = "message type must not be empty")]
    fn empty_message_type_is_rejected() {
        let _ = TransportMessage::build("", Identity::empty());
    }

    #[test]
    fn with_header_leaves_original_untouched() {
        let envelope = TransportMessage::build("OrderPlaced", Identity::for_message()).finish();
        let stamped = envelope.with_header("x-attempts", "2");

        assert_eq!(envelope.header("x-attempts"), None);
        assert_eq!(stamped.header("x-attempts"), Some("2"));
    }
}
