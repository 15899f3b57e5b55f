//! `QueueRepository`: looks up (creating on demand) the per-recipient
//! queue for a recipient identity, and picks the memory or persistent
//! backing per configuration (§6 `queue-path`).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redb::Database;
use tokio::sync::Mutex as AsyncMutex;

use super::memory::{MemoryQueue, QueueConfig};
use super::persistent::{self, PersistentQueue};
use super::Queue;
use crate::error::Error;
use crate::outbound::Outbound;
use crate::subscription::Cookie;
use crate::uri::Uri;

enum Backing {
    Memory,
    Persistent(Arc<AsyncMutex<Database>>),
}

/// Factory and lookup table for per-recipient queues (§4.1 "Queue
/// repository").
pub struct QueueRepository {
    outbound: Arc<dyn Outbound>,
    backing: Backing,
    config: QueueConfig,
    queues: Mutex<HashMap<String, Arc<dyn Queue>>>,
    /// When a queue's recipient key first dropped out of the live
    /// subscription set, per the most recent [`QueueRepository::reap`]
    /// sweep. Cleared the moment the recipient reappears.
    unreferenced_since: Mutex<HashMap<String, Instant>>,
}

impl QueueRepository {
    /// All queues created by this repository are in-memory only.
    pub fn memory(outbound: Arc<dyn Outbound>, config: QueueConfig) -> Self {
        QueueRepository {
            outbound,
            backing: Backing::Memory,
            config,
            queues: Mutex::new(HashMap::new()),
            unreferenced_since: Mutex::new(HashMap::new()),
        }
    }

    /// All queues created by this repository persist to `db` before the
    /// first delivery attempt.
    pub fn persistent(
        outbound: Arc<dyn Outbound>,
        db: Arc<AsyncMutex<Database>>,
        config: QueueConfig,
    ) -> Self {
        QueueRepository {
            outbound,
            backing: Backing::Persistent(db),
            config,
            queues: Mutex::new(HashMap::new()),
            unreferenced_since: Mutex::new(HashMap::new()),
        }
    }

    /// Picks memory or persistent backing based on whether `queue_path` is
    /// configured (§6).
    pub fn from_config(
        outbound: Arc<dyn Outbound>,
        queue_path: Option<&Path>,
        config: QueueConfig,
    ) -> Result<Self, Error> {
        match queue_path {
            Some(path) => {
                let db = persistent::open_database(path)?;
                Ok(QueueRepository::persistent(outbound, db, config))
            }
            None => Ok(QueueRepository::memory(outbound, config)),
        }
    }

    /// The stable identity a recipient+cookie-set collapses to for queue
    /// lookup and delivery deduplication (§4.2: "deduplicated by
    /// (recipient URI, cookie-set)").
    pub fn recipient_key(recipient: &Uri, cookies: &[Cookie]) -> String {
        let mut sorted: Vec<&Cookie> = cookies.iter().collect();
        sorted.sort_by(|a, b| (a.name.as_str(), a.value.as_str()).cmp(&(b.name.as_str(), b.value.as_str())));
        let mut key = recipient.to_string();
        for cookie in sorted {
            key.push('|');
            key.push_str(&cookie.name);
            key.push('=');
            key.push_str(&cookie.value);
        }
        key
    }

    /// Returns the queue for `recipient_key`, creating it (and spawning
    /// its dispatch loop) on first use.
    pub async fn get_or_create(&self, recipient_key: &str) -> Arc<dyn Queue> {
        if let Some(existing) = self.queues.lock().get(recipient_key) {
            return existing.clone();
        }

        let queue: Arc<dyn Queue> = match &self.backing {
            Backing::Memory => {
                MemoryQueue::spawn(recipient_key.to_string(), self.outbound.clone(), self.config)
            }
            Backing::Persistent(db) => {
                match PersistentQueue::spawn(
                    recipient_key.to_string(),
                    db.clone(),
                    self.outbound.clone(),
                    self.config,
                )
                .await
                {
                    Ok(q) => q,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            recipient = recipient_key,
                            "failed to open persistent queue, falling back to memory"
                        );
                        MemoryQueue::spawn(
                            recipient_key.to_string(),
                            self.outbound.clone(),
                            self.config,
                        )
                    }
                }
            }
        };

        let mut guard = self.queues.lock();
        // Another task may have created the same queue while we awaited
        // above; keep whichever was inserted first so the loser's worker
        // task simply idles forever with nothing enqueued to it.
        guard.entry(recipient_key.to_string()).or_insert(queue).clone()
    }

    /// Depth of the queue for `recipient_key`, if it has been created.
    pub fn queue_depth(&self, recipient_key: &str) -> Option<usize> {
        self.queues.lock().get(recipient_key).map(|q| q.depth())
    }

    /// Number of distinct recipient queues created so far.
    pub fn active_queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Stops every queue's dispatch loop without draining (§5, §9).
    pub fn shutdown_all(&self) {
        for queue in self.queues.lock().values() {
            queue.shutdown();
        }
    }

    /// Drops queues whose recipient has had no matching subscription for
    /// `grace`, per `live_recipient_keys` - the set of recipient keys any
    /// currently-registered subscription would dispatch to. A recipient
    /// that reappears before `grace` elapses keeps its queue and its
    /// backlog. Returns the recipient keys actually reclaimed, for the
    /// caller to log.
    pub fn reap(&self, live_recipient_keys: &HashSet<String>, grace: Duration) -> Vec<String> {
        let mut unreferenced = self.unreferenced_since.lock();
        unreferenced.retain(|key, _| !live_recipient_keys.contains(key));

        let mut queues = self.queues.lock();
        let mut reclaimed = Vec::new();
        for key in queues.keys().cloned().collect::<Vec<_>>() {
            if live_recipient_keys.contains(&key) {
                continue;
            }
            let since = *unreferenced.entry(key.clone()).or_insert_with(Instant::now);
            if since.elapsed() >= grace {
                if let Some(queue) = queues.remove(&key) {
                    queue.mark_dead();
                    unreferenced.remove(&key);
                    reclaimed.push(key);
                }
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::outbound::{DeliveryOutcome, HttpResponse, Method, Outbound};
    use crate::uri::Uri;
    use async_trait::async_trait;

    struct NoopOutbound;

    #[async_trait]
    impl Outbound for NoopOutbound {
        async fn send(
            &self,
            _recipient: &Uri,
            _method: Method,
            _headers: &[(String, String)],
            _body: &[u8],
        ) -> Result<DeliveryOutcome, Error> {
            Ok(DeliveryOutcome::Ack)
        }

        async fn fetch(&self, _recipient: &Uri) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        async fn chain_request(
            &self,
            _method: Method,
            _uri: &Uri,
            _body: &[u8],
        ) -> Result<HttpResponse, Error> {
            Ok(HttpResponse { status: 200, location: None, body: Vec::new() })
        }
    }

    #[tokio::test]
    async fn reap_leaves_live_queues_untouched() {
        let repo = QueueRepository::memory(Arc::new(NoopOutbound), QueueConfig::default());
        repo.get_or_create("http://r/sink").await;
        let live: HashSet<String> = ["http://r/sink".to_string()].into_iter().collect();
        let reclaimed = repo.reap(&live, Duration::from_secs(0));
        assert!(reclaimed.is_empty());
        assert_eq!(repo.active_queue_count(), 1);
    }

    #[tokio::test]
    async fn reap_drops_queues_unreferenced_past_grace() {
        let repo = QueueRepository::memory(Arc::new(NoopOutbound), QueueConfig::default());
        repo.get_or_create("http://r/sink").await;
        let empty: HashSet<String> = HashSet::new();

        // First sweep with zero grace starts the clock and immediately reaps
        // since `elapsed() >= 0` is always true.
        let reclaimed = repo.reap(&empty, Duration::from_secs(0));
        assert_eq!(reclaimed, vec!["http://r/sink".to_string()]);
        assert_eq!(repo.active_queue_count(), 0);
    }

    #[tokio::test]
    async fn reap_keeps_queue_within_grace_period() {
        let repo = QueueRepository::memory(Arc::new(NoopOutbound), QueueConfig::default());
        repo.get_or_create("http://r/sink").await;
        let empty: HashSet<String> = HashSet::new();

        let reclaimed = repo.reap(&empty, Duration::from_secs(3600));
        assert!(reclaimed.is_empty());
        assert_eq!(repo.active_queue_count(), 1);
    }
}
