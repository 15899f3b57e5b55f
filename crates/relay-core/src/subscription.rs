//! A single subscription entry within a [`crate::subscription_set::SubscriptionSet`].

use serde::{Deserialize, Serialize};

use crate::uri::Uri;

/// A `name=value` cookie carried alongside a recipient, echoed back on
/// delivery as an `X-Dream-Cookie-*` style header so the recipient can tell
/// which subscription produced the event without inspecting the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// One entry in a subscription set: a channel pattern, an optional resource
/// pattern, and the recipients that should receive matching events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Opaque identifier, unique within the owning set.
    pub id: String,

    /// Channel pattern. May contain wildcard components.
    pub channel: Uri,

    /// Optional resource pattern. When present, an event must also carry a
    /// resource and that resource must match this pattern.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource: Option<Uri>,

    /// Where matching events are delivered.
    pub recipients: Vec<Uri>,

    /// Cookies echoed back with every delivery to this subscription's
    /// recipients.
    #[serde(default)]
    pub cookies: Vec<Cookie>,

    /// Optional proxy URI; when set, the delivery queue is pointed at this
    /// URI instead of a recipient directly, and the original recipient is
    /// passed through as metadata.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proxy: Option<Uri>,
}

impl Subscription {
    /// True if this subscription's channel (and, if present, resource)
    /// pattern matches the given event channel/resource.
    pub fn matches(&self, event_channel: &Uri, event_resource: Option<&Uri>) -> bool {
        if !self.channel.matches_pattern(event_channel) {
            return false;
        }
        match (&self.resource, event_resource) {
            (None, _) => true,
            (Some(pattern), Some(resource)) => pattern.matches_pattern(resource),
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn sub(channel: &str, resource: Option<&str>) -> Subscription {
        Subscription {
            id: "s1".into(),
            channel: uri(channel),
            resource: resource.map(uri),
            recipients: vec![uri("http://recipient/h")],
            cookies: Vec::new(),
            proxy: None,
        }
    }

    #[test]
    fn matches_channel_only() {
        let s = sub("http://h/a/*", None);
        assert!(s.matches(&uri("http://h/a/b"), None));
        assert!(s.matches(&uri("http://h/a/b"), Some(&uri("http://h/r"))));
    }

    #[test]
    fn requires_resource_when_pattern_present() {
        let s = sub("http://h/a/*", Some("http://h/res/*"));
        assert!(!s.matches(&uri("http://h/a/b"), None));
        assert!(s.matches(&uri("http://h/a/b"), Some(&uri("http://h/res/x"))));
        assert!(!s.matches(&uri("http://h/a/b"), Some(&uri("http://h/other"))));
    }
}
