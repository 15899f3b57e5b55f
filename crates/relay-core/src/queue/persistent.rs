//! Persistent [`Queue`] variant: envelopes are written to a `redb` table
//! before the first delivery attempt and removed only on ack or
//! terminal-drop, so a process restart recovers whatever was still
//! in flight (§4.5 "Persistent-queue variant").

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use super::memory::QueueConfig;
use super::{backoff_delay, Queue, QueueState, QueuedEnvelope};
use crate::error::Error;
use crate::outbound::{DeliveryOutcome, Outbound};

/// A single table shared by every recipient's persistent queue. Keys are
/// `"{recipient_key}\0{seq:020}"` so that ranging over a recipient's
/// prefix yields its envelopes in FIFO (insertion) order; values are the
/// JSON-encoded [`QueuedEnvelope`].
const QUEUE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("dispatch_queue");

fn key_prefix(recipient_key: &str) -> String {
    format!("{recipient_key}\0")
}

fn key_for(recipient_key: &str, seq: u64) -> String {
    format!("{recipient_key}\0{seq:020}")
}

/// Opens (creating if absent) the shared `redb::Database` at `path` and
/// ensures [`QUEUE_TABLE`] exists.
pub fn open_database(path: &std::path::Path) -> Result<Arc<AsyncMutex<Database>>, Error> {
    let db = Database::create(path)
        .map_err(|e| Error::internal(format!("failed to open queue database: {e}")))?;
    let write_txn = db
        .begin_write()
        .map_err(|e| Error::internal(format!("redb begin_write failed: {e}")))?;
    let _ = write_txn
        .open_table(QUEUE_TABLE)
        .map_err(|e| Error::internal(format!("redb open_table failed: {e}")))?;
    write_txn
        .commit()
        .map_err(|e| Error::internal(format!("redb commit failed: {e}")))?;
    Ok(Arc::new(AsyncMutex::new(db)))
}

pub struct PersistentQueue {
    recipient_key: String,
    db: Arc<AsyncMutex<Database>>,
    next_seq: AtomicU64,
    depth: AtomicUsize,
    notify: Notify,
    state: RwLock<QueueState>,
    stop: AtomicBool,
    config: QueueConfig,
}

impl PersistentQueue {
    /// Recovers any envelopes left in `db` for `recipient_key` from a
    /// previous process, then spawns the dispatch loop.
    pub async fn spawn(
        recipient_key: String,
        db: Arc<AsyncMutex<Database>>,
        outbound: Arc<dyn Outbound>,
        config: QueueConfig,
    ) -> Result<Arc<Self>, Error> {
        let (recovered_depth, max_seq) = {
            let conn = db.lock().await;
            let read_txn = conn
                .begin_read()
                .map_err(|e| Error::internal(format!("redb begin_read failed: {e}")))?;
            let table = read_txn
                .open_table(QUEUE_TABLE)
                .map_err(|e| Error::internal(format!("redb open_table failed: {e}")))?;
            let prefix = key_prefix(&recipient_key);
            let mut count = 0usize;
            let mut max_seq = 0u64;
            for entry in table
                .range(prefix.as_str()..)
                .map_err(|e| Error::internal(format!("redb range failed: {e}")))?
            {
                let (key, _) = entry.map_err(|e| Error::internal(format!("redb entry failed: {e}")))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                count += 1;
                if let Some(seq_str) = key.value().rsplit('\0').next() {
                    if let Ok(seq) = seq_str.parse::<u64>() {
                        max_seq = max_seq.max(seq);
                    }
                }
            }
            (count, max_seq)
        };

        let queue = Arc::new(PersistentQueue {
            recipient_key,
            db,
            next_seq: AtomicU64::new(max_seq + 1),
            depth: AtomicUsize::new(recovered_depth),
            notify: Notify::new(),
            state: RwLock::new(QueueState::Idle),
            stop: AtomicBool::new(false),
            config,
        });
        if recovered_depth > 0 {
            queue.notify.notify_one();
        }
        tokio::spawn(run_dispatch_loop(queue.clone(), outbound));
        Ok(queue)
    }

    async fn pop_front(&self) -> Result<Option<(String, QueuedEnvelope)>, Error> {
        let conn = self.db.lock().await;
        let read_txn = conn
            .begin_read()
            .map_err(|e| Error::internal(format!("redb begin_read failed: {e}")))?;
        let table = read_txn
            .open_table(QUEUE_TABLE)
            .map_err(|e| Error::internal(format!("redb open_table failed: {e}")))?;
        let prefix = key_prefix(&self.recipient_key);
        let Some(entry) = table
            .range(prefix.as_str()..)
            .map_err(|e| Error::internal(format!("redb range failed: {e}")))?
            .next()
        else {
            return Ok(None);
        };
        let (key, value) = entry.map_err(|e| Error::internal(format!("redb entry failed: {e}")))?;
        if !key.value().starts_with(&prefix) {
            return Ok(None);
        }
        let full_key = key.value().to_string();
        let envelope: QueuedEnvelope = serde_json::from_str(value.value())
            .map_err(|e| Error::internal(format!("corrupt persisted envelope: {e}")))?;
        Ok(Some((full_key, envelope)))
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let conn = self.db.lock().await;
        let write_txn = conn
            .begin_write()
            .map_err(|e| Error::internal(format!("redb begin_write failed: {e}")))?;
        {
            let mut table = write_txn
                .open_table(QUEUE_TABLE)
                .map_err(|e| Error::internal(format!("redb open_table failed: {e}")))?;
            table
                .remove(key)
                .map_err(|e| Error::internal(format!("redb remove failed: {e}")))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::internal(format!("redb commit failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Queue for PersistentQueue {
    async fn enqueue(&self, envelope: QueuedEnvelope) {
        if self.depth.load(Ordering::SeqCst) >= self.config.max_depth {
            tracing::warn!(
                recipient = %self.recipient_key,
                "dropping event: persistent queue over max depth"
            );
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let key = key_for(&self.recipient_key, seq);
        let json = match serde_json::to_string(&envelope) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize envelope, dropping");
                return;
            }
        };

        let result: Result<(), Error> = async {
            let conn = self.db.lock().await;
            let write_txn = conn
                .begin_write()
                .map_err(|e| Error::internal(format!("redb begin_write failed: {e}")))?;
            {
                let mut table = write_txn
                    .open_table(QUEUE_TABLE)
                    .map_err(|e| Error::internal(format!("redb open_table failed: {e}")))?;
                table
                    .insert(key.as_str(), json.as_str())
                    .map_err(|e| Error::internal(format!("redb insert failed: {e}")))?;
            }
            write_txn
                .commit()
                .map_err(|e| Error::internal(format!("redb commit failed: {e}")))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                self.notify.notify_one();
            }
            Err(e) => tracing::error!(error = %e, "failed to persist envelope, dropping"),
        }
    }

    fn state(&self) -> QueueState {
        *self.state.read()
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn mark_dead(&self) {
        *self.state.write() = QueueState::Dead;
        self.shutdown();
    }
}

async fn run_dispatch_loop(queue: Arc<PersistentQueue>, outbound: Arc<dyn Outbound>) {
    loop {
        if queue.stop.load(Ordering::SeqCst) {
            return;
        }
        let next = match queue.pop_front().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "failed to read persistent queue, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };
        let Some((key, envelope)) = next else {
            *queue.state.write() = QueueState::Idle;
            queue.notify.notified().await;
            continue;
        };

        *queue.state.write() = QueueState::Delivering;
        let mut attempt: u32 = 0;
        loop {
            if queue.stop.load(Ordering::SeqCst) {
                return;
            }
            let mut headers = envelope.headers.clone();
            headers.push(("X-Dream-Event-Id".into(), envelope.event_id.clone()));
            headers.push(("X-Dream-Event-Channel".into(), envelope.channel.clone()));

            let outcome = outbound
                .send(&envelope.recipient, envelope.method, &headers, &envelope.body)
                .await;

            let done = match outcome {
                Ok(DeliveryOutcome::Ack) => true,
                Ok(DeliveryOutcome::Terminal) => {
                    tracing::warn!(
                        recipient = %queue.recipient_key,
                        event_id = %envelope.event_id,
                        "terminal delivery failure, dropping event"
                    );
                    true
                }
                Ok(DeliveryOutcome::Retry) | Err(_) => {
                    attempt += 1;
                    *queue.state.write() = QueueState::Retrying { attempt };
                    let delay = backoff_delay(
                        queue.config.retry_initial,
                        attempt,
                        queue.config.retry_ceiling,
                    );
                    tokio::time::sleep(delay).await;
                    false
                }
            };

            if done {
                if let Err(e) = queue.remove(&key).await {
                    tracing::error!(error = %e, "failed to remove delivered envelope from store");
                }
                queue.depth.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        }
    }
}
