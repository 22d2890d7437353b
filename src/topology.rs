//! Deterministic mapping from message types and broker addresses to
//! broker-native routing names.
//!
//! The registry is loaded once at process start and never mutated afterwards.
//! Types without an explicit entry fall back to a naming convention: the
//! type's own simple name.

use std::collections::HashMap;

use url::Url;

/// Immutable type-to-routing-name table with a convention fallback.
#[derive(Debug, Clone, Default)]
pub struct TopologyRegistry {
    overrides: HashMap<String, String>,
}

impl TopologyRegistry {
    /// A registry with no explicit mappings; every type resolves by
    /// convention.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with explicit type-to-name mappings.
    pub fn with_overrides<I, K, V>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: overrides
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Resolve the queue or topic name for a message type.
    ///
    /// The explicit mapping table is checked first; if the type has no entry
    /// the type's simple name (the segment after the last `.`) is the
    /// convention.
    ///
    /// Panics if `message_type` is empty; resolving an unnamed type is a
    /// programming error, not a recoverable condition.
    pub fn route_for(&self, message_type: &str) -> String {
        assert!(!message_type.is_empty(), "message type must not be empty");
        if let Some(name) = self.overrides.get(message_type) {
            return name.clone();
        }
        simple_name(message_type).to_owned()
    }
}

/// The queue name encoded in a broker address: the first non-empty path
/// segment, or the host component when the address has no path segments.
pub fn queue_from_address(address: &Url) -> String {
    if let Some(segment) = path_segments(address).into_iter().next() {
        return segment;
    }
    address.host_str().unwrap_or_default().to_owned()
}

/// The subscription name encoded in a hierarchical topic address: the path
/// segment immediately following a segment equal (case-insensitive) to
/// `subscriptions`. `None` when the address carries no such segment.
pub fn subscription_from_address(address: &Url) -> Option<String> {
    let segments = path_segments(address);
    segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case("subscriptions"))
        .and_then(|i| segments.get(i + 1))
        .cloned()
}

fn simple_name(message_type: &str) -> &str {
    message_type.rsplit('.').next().unwrap_or(message_type)
}

fn path_segments(address: &Url) -> Vec<String> {
    address
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_type_resolves_to_its_own_name() {
        let topology = TopologyRegistry::new();
        assert_eq!(topology.route_for("OrderPlaced"), "OrderPlaced");
    }

    #[test]
    fn qualified_type_resolves_to_its_simple_name() {
        let topology = TopologyRegistry::new();
        assert_eq!(topology.route_for("orders.events.OrderPlaced"), "OrderPlaced");
    }

    #[test]
    fn mapped_type_resolves_to_the_configured_override() {
        let topology = TopologyRegistry::with_overrides([("OrderPlaced", "orders-v2")]);
        assert_eq!(topology.route_for("OrderPlaced"), "orders-v2");
    }

    #[test]
    #[should_panic(expected = "message type must not be empty")]
    fn empty_type_is_a_programming_error() {
        TopologyRegistry::new().route_for("");
    }

    #[test]
    fn queue_name_is_the_first_path_segment() {
        let address = Url::parse("sb://host/queueA/subscriptions/subB").unwrap();
        assert_eq!(queue_from_address(&address), "queueA");
    }

    #[test]
    fn queue_name_falls_back_to_host() {
        let address = Url::parse("sb://orders-host").unwrap();
        assert_eq!(queue_from_address(&address), "orders-host");
    }

    #[test]
    fn subscription_follows_the_subscriptions_segment() {
        let address = Url::parse("sb://host/queueA/subscriptions/subB").unwrap();
        assert_eq!(subscription_from_address(&address), Some("subB".to_owned()));
    }

    #[test]
    fn subscriptions_segment_is_case_insensitive() {
        let address = Url::parse("sb://host/queueA/Subscriptions/subB").unwrap();
        assert_eq!(subscription_from_address(&address), Some("subB".to_owned()));
    }

    #[test]
    fn subscription_is_absent_without_the_marker_segment() {
        let address = Url::parse("sb://host/queueA").unwrap();
        assert_eq!(subscription_from_address(&address), None);
    }
}
