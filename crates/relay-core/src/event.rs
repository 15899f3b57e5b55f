//! `DispatchEvent`: the unit of data that flows through the dispatcher and
//! delivery queues.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uri::Uri;

/// A single published event, decoded from (or destined to be encoded as) an
/// XML event envelope (see [`crate::xml`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Unique event id, generated on publish if the caller did not supply
    /// one.
    pub id: Uuid,

    /// The channel the event was published on.
    pub channel: Uri,

    /// Optional resource the event concerns.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource: Option<Uri>,

    /// Extra headers to carry through to delivery (`X-Dream-*` and any the
    /// publisher supplied), order preserved.
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// Raw event body, exactly as published, re-delivered byte for byte.
    #[serde(with = "body_as_string")]
    pub body: Vec<u8>,

    /// Locations this event has already passed through. Used to break
    /// loops across chained relays: an event is never re-dispatched to a
    /// relay already present in `via`.
    #[serde(default)]
    pub via: Vec<String>,
}

impl DispatchEvent {
    /// Builds a new event with a fresh id and empty `via` chain.
    pub fn new(channel: Uri, resource: Option<Uri>, body: Vec<u8>) -> Self {
        DispatchEvent {
            id: Uuid::new_v4(),
            channel,
            resource,
            headers: Vec::new(),
            body,
            via: Vec::new(),
        }
    }

    /// True if this event has already visited `location`.
    pub fn has_visited(&self, location: &str) -> bool {
        self.via.iter().any(|v| v == location)
    }

    /// Returns a copy with `location` appended to `via`.
    pub fn with_via(&self, location: &str) -> Self {
        let mut via = self.via.clone();
        via.push(location.to_string());
        DispatchEvent {
            via,
            ..self.clone()
        }
    }
}

mod body_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_tracking_breaks_loops() {
        let event = DispatchEvent::new("http://h/c".parse().unwrap(), None, b"{}".to_vec());
        assert!(!event.has_visited("relay-a"));
        let event = event.with_via("relay-a");
        assert!(event.has_visited("relay-a"));
        assert!(!event.has_visited("relay-b"));
    }
}
