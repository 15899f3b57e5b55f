//! The dispatcher: owns the registry, the derived channel index, and the
//! queue repository, and is the one type both `relay-http` and the
//! chaining protocol drive (§4.4).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::event::DispatchEvent;
use crate::outbound::Method;
use crate::prefix_map::PrefixMap;
use crate::queue::memory::QueueConfig;
use crate::queue::{QueueRepository, QueuedEnvelope};
use crate::registry::Registry;
use crate::subscription::{Cookie, Subscription};
use crate::subscription_set::SubscriptionSet;
use crate::uri::Uri;
use crate::xml::event::render_event;
use crate::xml::subscription_set::render_subscription_set;

/// The reserved channel scheme for dispatcher-internal notifications.
/// External publishers are never allowed to use it (§3, §4.4).
pub const RESERVED_SCHEME: &str = "pubsub";

#[derive(Debug, Clone)]
struct MatchEntry {
    channel_pattern: Uri,
    resource_pattern: Option<Uri>,
    recipients: Vec<Uri>,
    cookies: Vec<Cookie>,
}

impl From<&Subscription> for MatchEntry {
    fn from(sub: &Subscription) -> Self {
        MatchEntry {
            channel_pattern: sub.channel.clone(),
            resource_pattern: sub.resource.clone(),
            recipients: sub.recipients.clone(),
            cookies: sub.cookies.clone(),
        }
    }
}

/// Snapshot of the registry's subscriptions, organized for cheap lookup by
/// an event's channel. Replaced atomically on every registry mutation
/// (§5: "the index is replaced atomically (copy-on-write)").
///
/// Patterns whose static (non-wildcard) channel prefix covers scheme and
/// host:port are indexed in `by_prefix`, a [`PrefixMap`] walked via the
/// event's own concrete path - the common case. Patterns that wildcard the
/// host:port (e.g. chaining's `pubsub://*/*`) or the scheme itself sit in
/// `by_scheme` / `global`, since a concrete path walk can never reach a
/// node it would have to detour through a literal `*` to find.
#[derive(Default)]
struct ChannelIndex {
    by_prefix: PrefixMap<Vec<MatchEntry>>,
    by_scheme: HashMap<String, Vec<MatchEntry>>,
    global: Vec<MatchEntry>,
}

impl ChannelIndex {
    fn build<'a>(subscriptions: impl Iterator<Item = &'a Subscription>) -> Self {
        let mut index = ChannelIndex::default();
        for sub in subscriptions {
            let entry = MatchEntry::from(sub);
            let prefix = sub.channel.static_prefix();
            match prefix.len() {
                0 => index.global.push(entry),
                1 => index.by_scheme.entry(prefix[0].clone()).or_default().push(entry),
                _ => {
                    let key = Uri::from_parts(prefix[0].clone(), prefix[1].clone(), prefix[2..].to_vec());
                    let mut bucket = index.by_prefix.remove(&key).unwrap_or_default();
                    bucket.push(entry);
                    let _ = index.by_prefix.insert(&key, bucket, false);
                }
            }
        }
        index
    }

    fn candidates(&self, channel: &Uri) -> Vec<&MatchEntry> {
        let mut out: Vec<&MatchEntry> = self.global.iter().collect();
        if let Some(bucket) = self.by_scheme.get(channel.scheme()) {
            out.extend(bucket.iter());
        }
        for bucket in self.by_prefix.ancestors(channel) {
            out.extend(bucket.iter());
        }
        out
    }
}

/// Top-level dispatch subsystem: registry + channel index + queues.
pub struct Dispatcher {
    self_uri: Uri,
    registry: RwLock<Registry>,
    index: ArcSwap<ChannelIndex>,
    queues: QueueRepository,
    /// Flipped by [`Dispatcher::shutdown`]; chaining retry loops and the
    /// dead-queue reaper both poll it to stop promptly instead of running
    /// their full budget after shutdown is requested.
    shutdown_flag: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(self_uri: Uri, queues: QueueRepository) -> Arc<Self> {
        Arc::new(Dispatcher {
            self_uri,
            registry: RwLock::new(Registry::new()),
            index: ArcSwap::from_pointee(ChannelIndex::default()),
            queues,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn self_uri(&self) -> &Uri {
        &self.self_uri
    }

    /// Shared with the chaining protocol and the dead-queue reaper so both
    /// can stop their background loops as soon as [`Dispatcher::shutdown`]
    /// is called rather than running to completion.
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    /// Stops the queue worker pool and any chaining retry tasks cleanly.
    /// Drains no in-flight work (§5's stated non-goal): envelopes already
    /// queued or mid-delivery are simply abandoned.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.queues.shutdown_all();
    }

    /// Recipient keys any currently-registered subscription would dispatch
    /// to - the "live" set the dead-queue reaper measures queues against
    /// (§4.9).
    fn live_recipient_keys(&self) -> HashSet<String> {
        let registry = self.registry.read();
        registry
            .iter_sets()
            .flat_map(|s| s.subscriptions.iter())
            .flat_map(|sub| {
                sub.recipients
                    .iter()
                    .map(|r| QueueRepository::recipient_key(r, &sub.cookies))
            })
            .collect()
    }

    /// Spawns the periodic sweep that reclaims queues whose recipient has
    /// had no matching subscription for `grace`, checking every `interval`.
    /// Stops once [`Dispatcher::shutdown`] is called.
    pub fn spawn_queue_reaper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        grace: std::time::Duration,
    ) {
        let dispatcher = self.clone();
        let stop = self.shutdown_flag();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let live = dispatcher.live_recipient_keys();
                let reclaimed = dispatcher.queues.reap(&live, grace);
                if !reclaimed.is_empty() {
                    tracing::info!(count = reclaimed.len(), recipients = ?reclaimed, "reaped dead queues");
                }
            }
        });
    }

    fn rebuild_index(&self) {
        let registry = self.registry.read();
        let index = ChannelIndex::build(registry.iter_sets().flat_map(|s| s.subscriptions.iter()));
        self.index.store(Arc::new(index));
    }

    /// Emits the combined-set-changed notification on the reserved
    /// `pubsub://<self>/changes` channel (§4.3).
    fn emit_change(&self) {
        let combined = self.combined_set();
        let doc = match render_subscription_set(&combined) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(error = %e, "failed to render combined set for change notification");
                return;
            }
        };
        let channel = Uri::from_parts(RESERVED_SCHEME, self.self_uri.hostport(), vec!["changes".into()]);
        let event = DispatchEvent::new(channel, None, doc);
        self.dispatch_internal(event);
    }

    #[instrument(skip(self, doc))]
    pub fn register(
        &self,
        location_hint: Option<String>,
        doc: SubscriptionSet,
        access_key_hint: Option<String>,
    ) -> (SubscriptionSet, bool) {
        let (set, existed) = self.registry.write().register(location_hint, doc, access_key_hint);
        if !existed {
            self.rebuild_index();
            self.emit_change();
        }
        (set, existed)
    }

    #[instrument(skip(self, subscriptions))]
    pub fn replace(
        &self,
        location: &str,
        access_key: &str,
        subscriptions: Vec<Subscription>,
        version: u64,
    ) -> Result<SubscriptionSet> {
        let set = self.registry.write().replace(location, access_key, subscriptions, version)?;
        self.rebuild_index();
        self.emit_change();
        Ok(set)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, location: &str, access_key: &str) -> Result<()> {
        self.registry.write().remove(location, access_key)?;
        self.rebuild_index();
        self.emit_change();
        Ok(())
    }

    pub fn get(&self, location: &str, access_key: &str) -> Result<SubscriptionSet> {
        self.registry.read().get(location, access_key)
    }

    pub fn get_all(&self) -> Vec<SubscriptionSet> {
        self.registry.read().get_all()
    }

    pub fn combined_set(&self) -> SubscriptionSet {
        self.registry.read().combined_set(&self.self_uri)
    }

    /// Number of recipient queues currently materialized, and the depth
    /// of each - the supplemental introspection surface from the
    /// diagnostics endpoint.
    pub fn queue_depths(&self) -> usize {
        self.queues.active_queue_count()
    }

    /// Entry point for externally published events (`POST /publish`).
    /// Rejects the reserved scheme and loop-breaks on `via`.
    #[instrument(skip(self, event))]
    pub fn dispatch(&self, event: DispatchEvent) -> Result<DispatchEvent> {
        if event.channel.scheme() == RESERVED_SCHEME {
            return Err(Error::Forbidden(format!(
                "channel scheme `{RESERVED_SCHEME}` is reserved for dispatcher-internal events"
            )));
        }
        self.dispatch_checked(event)
    }

    fn dispatch_checked(&self, event: DispatchEvent) -> Result<DispatchEvent> {
        let self_id = self.self_uri.to_string();
        if event.has_visited(&self_id) {
            return Err(Error::Forbidden(
                "event has already traversed this dispatcher".to_string(),
            ));
        }
        let echoed = event.clone();
        self.dispatch_internal(event);
        Ok(echoed)
    }

    /// Dispatches `event` without the reserved-scheme check; used both by
    /// [`Dispatcher::dispatch`] after its check passes and by
    /// [`Dispatcher::emit_change`] for internally-generated notifications.
    fn dispatch_internal(&self, event: DispatchEvent) {
        let self_id = self.self_uri.to_string();
        let stamped = event.with_via(&self_id);
        let method = if event.channel.scheme() == RESERVED_SCHEME {
            Method::Put
        } else {
            Method::Post
        };

        let index = self.index.load();
        let mut seen: HashSet<String> = HashSet::new();
        let mut deliveries: Vec<(String, Uri, Vec<Cookie>)> = Vec::new();

        for candidate in index.candidates(&event.channel) {
            if !candidate
                .channel_pattern
                .matches_pattern(&event.channel)
            {
                continue;
            }
            if let Some(pattern) = &candidate.resource_pattern {
                match &event.resource {
                    Some(resource) if pattern.matches_pattern(resource) => {}
                    _ => continue,
                }
            }
            for recipient in &candidate.recipients {
                let key = QueueRepository::recipient_key(recipient, &candidate.cookies);
                if seen.insert(key.clone()) {
                    deliveries.push((key, recipient.clone(), candidate.cookies.clone()));
                }
            }
        }

        let body = match render_event(&stamped) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to render event for delivery");
                return;
            }
        };

        for (key, recipient, cookies) in deliveries {
            let envelope = QueuedEnvelope {
                event_id: stamped.id.to_string(),
                channel: stamped.channel.to_string(),
                recipient,
                cookies,
                method,
                headers: stamped.headers.clone(),
                body: body.clone(),
            };
            let queues = &self.queues;
            let key = key.clone();
            // Enqueueing spawns/reuses the recipient's queue; this is the
            // only async hop in an otherwise synchronous, non-blocking
            // `Dispatch` (§4.4: "`Dispatch(event)` is non-blocking").
            tokio::spawn(async move {
                let queue = queues.get_or_create(&key).await;
                queue.enqueue(envelope).await;
            });
        }
    }

    /// Used by the chaining protocol to register a local subscription
    /// whose recipient is a peer dispatcher, without going through the
    /// HTTP-facing `register` path's location/access-key hints.
    pub fn register_chain_subscription(&self, owner: Uri, subscription: Subscription) -> SubscriptionSet {
        let mut doc = SubscriptionSet::new(owner);
        doc.subscriptions.push(subscription);
        self.register(None, doc, None).0
    }

    pub fn queue_repository(&self) -> &QueueRepository {
        &self.queues
    }
}

pub use crate::queue::memory::QueueConfig as DispatcherQueueConfig;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error as CoreError;
    use crate::outbound::{DeliveryOutcome, Outbound};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingOutbound {
        received: StdMutex<Vec<(String, Method, Vec<u8>)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send(
            &self,
            recipient: &Uri,
            method: Method,
            _headers: &[(String, String)],
            body: &[u8],
        ) -> std::result::Result<DeliveryOutcome, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received
                .lock()
                .unwrap()
                .push((recipient.to_string(), method, body.to_vec()));
            Ok(DeliveryOutcome::Ack)
        }

        async fn fetch(&self, _recipient: &Uri) -> std::result::Result<Vec<u8>, CoreError> {
            Ok(Vec::new())
        }

        async fn chain_request(
            &self,
            _method: Method,
            _uri: &Uri,
            _body: &[u8],
        ) -> std::result::Result<crate::outbound::HttpResponse, CoreError> {
            Ok(crate::outbound::HttpResponse {
                status: 200,
                location: None,
                body: Vec::new(),
            })
        }
    }

    fn build(outbound: Arc<RecordingOutbound>) -> Arc<Dispatcher> {
        let queues = QueueRepository::memory(outbound, QueueConfig {
            retry_initial: std::time::Duration::from_millis(1),
            ..QueueConfig::default()
        });
        Dispatcher::new("pubsub://relay-1".parse().unwrap(), queues)
    }

    #[tokio::test]
    async fn rejects_reserved_scheme_from_external_publish() {
        let dispatcher = build(Arc::new(RecordingOutbound::default()));
        let event = DispatchEvent::new("pubsub://x/y".parse().unwrap(), None, Vec::new());
        let err = dispatcher.dispatch(event).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn rejects_event_that_already_visited_self() {
        let dispatcher = build(Arc::new(RecordingOutbound::default()));
        let mut event = DispatchEvent::new("http://evt/a".parse().unwrap(), None, Vec::new());
        event.via.push("pubsub://relay-1".to_string());
        let err = dispatcher.dispatch(event).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn register_then_publish_delivers_to_matching_recipient() {
        let outbound = Arc::new(RecordingOutbound::default());
        let dispatcher = build(outbound.clone());

        let mut doc = SubscriptionSet::new("http://client/a".parse().unwrap());
        doc.subscriptions.push(Subscription {
            id: "s1".into(),
            channel: "http://evt/a/*".parse().unwrap(),
            resource: None,
            recipients: vec!["http://r/sink".parse().unwrap()],
            cookies: Vec::new(),
            proxy: None,
        });
        dispatcher.register(None, doc, None);

        let event = DispatchEvent::new("http://evt/a/b/1".parse().unwrap(), None, b"{}".to_vec());
        dispatcher.dispatch(event).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 1);
        let received = outbound.received.lock().unwrap();
        assert_eq!(received[0].0, "http://r/sink");
        assert_eq!(received[0].1, Method::Post);
    }

    #[tokio::test]
    async fn registering_triggers_change_notification_via_put() {
        let outbound = Arc::new(RecordingOutbound::default());
        let dispatcher = build(outbound.clone());

        // Subscribe a peer to the reserved change channel, as chaining does.
        dispatcher.register_chain_subscription(
            "pubsub://peer".parse().unwrap(),
            Subscription {
                id: "mirror".into(),
                channel: "pubsub://*/*".parse().unwrap(),
                resource: None,
                recipients: vec!["http://peer/subscribers/abc".parse().unwrap()],
                cookies: Vec::new(),
                proxy: None,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let received = outbound.received.lock().unwrap();
        assert!(received.iter().any(|(_, method, _)| *method == Method::Put));
    }

    #[tokio::test]
    async fn shutdown_flips_flag_and_stops_queue_workers() {
        let dispatcher = build(Arc::new(RecordingOutbound::default()));

        let mut doc = SubscriptionSet::new("http://client/a".parse().unwrap());
        doc.subscriptions.push(Subscription {
            id: "s1".into(),
            channel: "http://evt/a/*".parse().unwrap(),
            resource: None,
            recipients: vec!["http://r/sink".parse().unwrap()],
            cookies: Vec::new(),
            proxy: None,
        });
        dispatcher.register(None, doc, None);
        let event = DispatchEvent::new("http://evt/a/b/1".parse().unwrap(), None, b"{}".to_vec());
        dispatcher.dispatch(event).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let flag = dispatcher.shutdown_flag();
        assert!(!flag.load(Ordering::SeqCst));
        dispatcher.shutdown();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(
            dispatcher.queue_repository().queue_depth("http://r/sink"),
            Some(0)
        );
    }

    #[tokio::test]
    async fn reaper_reclaims_queue_with_no_live_subscription() {
        let dispatcher = build(Arc::new(RecordingOutbound::default()));

        let mut doc = SubscriptionSet::new("http://client/a".parse().unwrap());
        doc.subscriptions.push(Subscription {
            id: "s1".into(),
            channel: "http://evt/a/*".parse().unwrap(),
            resource: None,
            recipients: vec!["http://r/sink".parse().unwrap()],
            cookies: Vec::new(),
            proxy: None,
        });
        let (set, _) = dispatcher.register(None, doc, None);

        let event = DispatchEvent::new("http://evt/a/b/1".parse().unwrap(), None, b"{}".to_vec());
        dispatcher.dispatch(event).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(dispatcher.queue_repository().active_queue_count(), 1);

        dispatcher
            .remove(&set.location, &set.access_key)
            .unwrap();

        let live = dispatcher.live_recipient_keys();
        assert!(live.is_empty());
        let reclaimed = dispatcher
            .queue_repository()
            .reap(&live, std::time::Duration::from_secs(0));
        assert_eq!(reclaimed, vec!["http://r/sink".to_string()]);
        assert_eq!(dispatcher.queue_repository().active_queue_count(), 0);
    }
}
