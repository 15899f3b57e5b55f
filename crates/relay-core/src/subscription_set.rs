//! `SubscriptionSet`: the unit of registration in the dispatch registry.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::subscription::Subscription;
use crate::uri::Uri;

/// Length of a generated location token (`/subscribers/{location}`).
const LOCATION_LEN: usize = 8;

/// A named collection of [`Subscription`]s registered by one owner.
///
/// Sets are versioned: every successful `Replace` increments `version`, and
/// a `Replace` carrying a version that is not strictly greater than the
/// currently-registered one is rejected (see [`crate::error::Error::NotModified`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSet {
    /// Opaque token identifying this set's location (`/subscribers/{location}`).
    pub location: String,

    /// The URI this set was registered under, e.g. the client's callback
    /// base. Unique across the registry.
    pub owner: Uri,

    /// Access key required to `Replace` or `Remove` this set, or to read it
    /// back in full via `GET /subscribers/{location}`.
    pub access_key: String,

    /// Monotonically increasing version, bumped on every accepted `Replace`.
    pub version: u64,

    /// The subscriptions themselves.
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Builds a fresh set with a randomly generated location and access
    /// key, version `0`, and no subscriptions yet.
    pub fn new(owner: Uri) -> Self {
        SubscriptionSet {
            location: generate_token(LOCATION_LEN),
            owner,
            access_key: generate_token(16),
            version: 0,
            subscriptions: Vec::new(),
        }
    }

    /// True if `candidate` is the configured access key for this set
    /// (case-insensitive, §4.8).
    pub fn authorized(&self, candidate: &str) -> bool {
        self.access_key.eq_ignore_ascii_case(candidate)
    }
}

fn generate_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_set_has_distinct_location_and_access_key() {
        let owner: Uri = "http://client/cb".parse().unwrap();
        let a = SubscriptionSet::new(owner.clone());
        let b = SubscriptionSet::new(owner);
        assert_ne!(a.location, b.location);
        assert_ne!(a.access_key, b.access_key);
        assert_eq!(a.location.len(), LOCATION_LEN);
        assert_eq!(a.version, 0);
    }

    #[test]
    fn authorized_checks_access_key() {
        let set = SubscriptionSet::new("http://client/cb".parse().unwrap());
        assert!(set.authorized(&set.access_key));
        assert!(!set.authorized("wrong"));
    }

    #[test]
    fn authorized_is_case_insensitive() {
        let mut set = SubscriptionSet::new("http://client/cb".parse().unwrap());
        set.access_key = "AbC123".to_string();
        assert!(set.authorized("abc123"));
        assert!(set.authorized("ABC123"));
    }
}
