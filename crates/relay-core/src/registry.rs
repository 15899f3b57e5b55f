//! The subscription-set registry: `Register`/`Replace`/`Remove`/`Get`/`GetAll`
//! plus the derived combined set (§4.3).
//!
//! This type owns no locking of its own; [`crate::dispatcher::Dispatcher`]
//! wraps it in the single registry mutex called for in §5 and rebuilds its
//! channel index after every structural change.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::subscription_set::SubscriptionSet;
use crate::uri::Uri;

/// In-memory table of subscription sets, keyed by location, with a
/// secondary index enforcing owner uniqueness.
#[derive(Debug, Default)]
pub struct Registry {
    by_location: HashMap<String, SubscriptionSet>,
    location_by_owner: HashMap<Uri, String>,
    /// Bumped on every accepted structural change; used as the combined
    /// set's version so chained peers can tell revisions apart.
    revision: u64,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers `doc`. If `location_hint` names an already-registered
    /// location, or `doc.owner` already has a set under a different
    /// location, the existing set is returned unchanged with `existed =
    /// true` and no mutation occurs. Otherwise a new set is stored (using
    /// `location_hint`/`access_key_hint` when supplied, or server-generated
    /// values from `doc` otherwise) and returned with `existed = false`.
    pub fn register(
        &mut self,
        location_hint: Option<String>,
        mut doc: SubscriptionSet,
        access_key_hint: Option<String>,
    ) -> (SubscriptionSet, bool) {
        if let Some(loc) = &location_hint {
            if let Some(existing) = self.by_location.get(loc) {
                return (existing.clone(), true);
            }
        }
        if let Some(existing_loc) = self.location_by_owner.get(&doc.owner) {
            let existing = self
                .by_location
                .get(existing_loc)
                .expect("owner index points at a live location");
            return (existing.clone(), true);
        }

        if let Some(loc) = location_hint {
            doc.location = loc;
        }
        if let Some(key) = access_key_hint {
            doc.access_key = key;
        }
        self.location_by_owner
            .insert(doc.owner.clone(), doc.location.clone());
        self.by_location.insert(doc.location.clone(), doc.clone());
        self.revision += 1;
        (doc, false)
    }

    /// Replaces the subscriptions of the set at `location`. Fails with
    /// `NotFound` if unknown, `Forbidden` on access-key mismatch, and
    /// `NotModified` if `doc.version` does not strictly exceed the
    /// existing version (the existing set is left untouched in that case).
    pub fn replace(
        &mut self,
        location: &str,
        access_key: &str,
        subscriptions: Vec<crate::subscription::Subscription>,
        version: u64,
    ) -> Result<SubscriptionSet> {
        let existing = self
            .by_location
            .get(location)
            .ok_or_else(|| Error::NotFound(location.to_string()))?;
        if !existing.authorized(access_key) {
            return Err(Error::Forbidden(format!(
                "access key mismatch for location {location}"
            )));
        }
        if version <= existing.version {
            return Err(Error::NotModified);
        }
        let set = self
            .by_location
            .get_mut(location)
            .expect("checked above");
        set.subscriptions = subscriptions;
        set.version = version;
        self.revision += 1;
        Ok(set.clone())
    }

    /// Removes the set at `location`. Idempotent: removing an unknown
    /// location is not an error. Removing a known location without the
    /// correct access key is `Forbidden`.
    pub fn remove(&mut self, location: &str, access_key: &str) -> Result<()> {
        let Some(existing) = self.by_location.get(location) else {
            return Ok(());
        };
        if !existing.authorized(access_key) {
            return Err(Error::Forbidden(format!(
                "access key mismatch for location {location}"
            )));
        }
        let set = self.by_location.remove(location).expect("checked above");
        self.location_by_owner.remove(&set.owner);
        self.revision += 1;
        Ok(())
    }

    /// Returns the set at `location` if `access_key` matches.
    pub fn get(&self, location: &str, access_key: &str) -> Result<SubscriptionSet> {
        let set = self
            .by_location
            .get(location)
            .ok_or_else(|| Error::NotFound(location.to_string()))?;
        if !set.authorized(access_key) {
            return Err(Error::Forbidden(format!(
                "access key mismatch for location {location}"
            )));
        }
        Ok(set.clone())
    }

    /// All registered sets, for the diagnostics endpoint. No access
    /// control: operators reach this endpoint directly, not end clients.
    pub fn get_all(&self) -> Vec<SubscriptionSet> {
        self.by_location.values().cloned().collect()
    }

    /// The derived combined set: every subscription from every registered
    /// set, owned by `self_uri`. Version tracks the registry's internal
    /// revision counter so peers can detect that it changed.
    pub fn combined_set(&self, self_uri: &Uri) -> SubscriptionSet {
        let mut combined = SubscriptionSet::new(self_uri.clone());
        combined.version = self.revision;
        combined.location = String::new();
        combined.access_key = String::new();
        for set in self.by_location.values() {
            combined.subscriptions.extend(set.subscriptions.iter().cloned());
        }
        combined
    }

    /// Current revision counter, for callers that want to detect whether
    /// the combined set changed without recomputing it.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Borrowing iterator over every registered set, used by the
    /// dispatcher to rebuild its channel index.
    pub fn iter_sets(&self) -> impl Iterator<Item = &SubscriptionSet> {
        self.by_location.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription_set::SubscriptionSet;

    fn owner(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn register_assigns_server_location_and_key() {
        let mut reg = Registry::new();
        let doc = SubscriptionSet::new(owner("http://client/a"));
        let (set, existed) = reg.register(None, doc, None);
        assert!(!existed);
        assert!(reg.get(&set.location, &set.access_key).is_ok());
    }

    #[test]
    fn register_is_idempotent_on_owner_collision() {
        let mut reg = Registry::new();
        let (first, _) = reg.register(None, SubscriptionSet::new(owner("http://client/a")), None);
        let (second, existed) =
            reg.register(None, SubscriptionSet::new(owner("http://client/a")), None);
        assert!(existed);
        assert_eq!(first.location, second.location);
    }

    #[test]
    fn replace_rejects_stale_version() {
        let mut reg = Registry::new();
        let (set, _) = reg.register(None, SubscriptionSet::new(owner("http://client/a")), None);
        reg.replace(&set.location, &set.access_key, Vec::new(), 7).unwrap();
        let err = reg
            .replace(&set.location, &set.access_key, Vec::new(), 5)
            .unwrap_err();
        assert!(matches!(err, Error::NotModified));
    }

    #[test]
    fn replace_rejects_wrong_access_key() {
        let mut reg = Registry::new();
        let (set, _) = reg.register(None, SubscriptionSet::new(owner("http://client/a")), None);
        let err = reg
            .replace(&set.location, "wrong-key", Vec::new(), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = Registry::new();
        let (set, _) = reg.register(None, SubscriptionSet::new(owner("http://client/a")), None);
        reg.remove(&set.location, &set.access_key).unwrap();
        reg.remove(&set.location, &set.access_key).unwrap();
        assert!(reg.get(&set.location, &set.access_key).is_err());
    }

    #[test]
    fn combined_set_unions_all_subscriptions() {
        let mut reg = Registry::new();
        let mut doc_a = SubscriptionSet::new(owner("http://client/a"));
        doc_a.subscriptions.push(crate::subscription::Subscription {
            id: "s1".into(),
            channel: "http://evt/a".parse().unwrap(),
            resource: None,
            recipients: vec!["http://r/1".parse().unwrap()],
            cookies: Vec::new(),
            proxy: None,
        });
        reg.register(None, doc_a, None);
        let combined = reg.combined_set(&owner("pubsub://self"));
        assert_eq!(combined.subscriptions.len(), 1);
    }
}
