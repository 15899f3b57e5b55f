//! In-memory [`Queue`]: envelopes live only in process memory, lost on
//! restart. Used when no `queue-path` is configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::{backoff_delay, Queue, QueueState, QueuedEnvelope, DEFAULT_MAX_DEPTH};
use crate::outbound::{DeliveryOutcome, Outbound};

/// Backoff and capacity settings shared by both queue variants.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub retry_initial: Duration,
    pub retry_ceiling: Duration,
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            retry_initial: Duration::from_secs(60),
            retry_ceiling: Duration::from_secs(60 * 30),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

pub struct MemoryQueue {
    recipient_key: String,
    envelopes: Mutex<VecDeque<QueuedEnvelope>>,
    notify: Notify,
    state: RwLock<QueueState>,
    stop: AtomicBool,
    config: QueueConfig,
}

impl MemoryQueue {
    /// Builds a queue and spawns its dispatch-loop task immediately.
    pub fn spawn(
        recipient_key: String,
        outbound: Arc<dyn Outbound>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let queue = Arc::new(MemoryQueue {
            recipient_key,
            envelopes: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            state: RwLock::new(QueueState::Idle),
            stop: AtomicBool::new(false),
            config,
        });
        tokio::spawn(run_dispatch_loop(queue.clone(), outbound));
        queue
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, envelope: QueuedEnvelope) {
        let mut guard = self.envelopes.lock();
        if guard.len() >= self.config.max_depth {
            tracing::warn!(
                recipient = %self.recipient_key,
                depth = guard.len(),
                "dropping event: queue over max depth"
            );
            return;
        }
        guard.push_back(envelope);
        drop(guard);
        self.notify.notify_one();
    }

    fn state(&self) -> QueueState {
        *self.state.read()
    }

    fn depth(&self) -> usize {
        self.envelopes.lock().len()
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

async fn run_dispatch_loop(queue: Arc<MemoryQueue>, outbound: Arc<dyn Outbound>) {
    loop {
        if queue.stop.load(Ordering::SeqCst) {
            return;
        }
        let next = queue.envelopes.lock().pop_front();
        let Some(envelope) = next else {
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

            match outcome {
                Ok(DeliveryOutcome::Ack) => break,
                Ok(DeliveryOutcome::Terminal) => {
                    tracing::warn!(
                        recipient = %queue.recipient_key,
                        event_id = %envelope.event_id,
                        "terminal delivery failure, dropping event"
                    );
                    break;
                }
                Ok(DeliveryOutcome::Retry) | Err(_) => {
                    attempt += 1;
                    *queue.state.write() = QueueState::Retrying { attempt };
                    let delay = backoff_delay(
                        queue.config.retry_initial,
                        attempt,
                        queue.config.retry_ceiling,
                    );
                    tracing::debug!(
                        recipient = %queue.recipient_key,
                        event_id = %envelope.event_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "retrying delivery"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::uri::Uri;
    use std::sync::atomic::AtomicUsize;

    struct CountingOutbound {
        calls: AtomicUsize,
        outcome: DeliveryOutcome,
    }

    #[async_trait]
    impl Outbound for CountingOutbound {
        async fn send(
            &self,
            _recipient: &Uri,
            _method: crate::outbound::Method,
            _headers: &[(String, String)],
            _body: &[u8],
        ) -> Result<DeliveryOutcome, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }

        async fn fetch(&self, _recipient: &Uri) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        async fn chain_request(
            &self,
            _method: crate::outbound::Method,
            _uri: &Uri,
            _body: &[u8],
        ) -> Result<crate::outbound::HttpResponse, Error> {
            Ok(crate::outbound::HttpResponse {
                status: 200,
                location: None,
                body: Vec::new(),
            })
        }
    }

    fn envelope() -> QueuedEnvelope {
        QueuedEnvelope {
            event_id: "e1".into(),
            channel: "http://evt/a".into(),
            recipient: "http://r/sink".parse().unwrap(),
            cookies: Vec::new(),
            method: crate::outbound::Method::Post,
            headers: Vec::new(),
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn acked_envelope_is_removed_and_not_retried() {
        let outbound = Arc::new(CountingOutbound {
            calls: AtomicUsize::new(0),
            outcome: DeliveryOutcome::Ack,
        });
        let queue = MemoryQueue::spawn(
            "recipient".into(),
            outbound.clone(),
            QueueConfig {
                retry_initial: Duration::from_millis(1),
                ..QueueConfig::default()
            },
        );
        queue.enqueue(envelope()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.depth(), 0);
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drops_on_terminal_failure() {
        let outbound = Arc::new(CountingOutbound {
            calls: AtomicUsize::new(0),
            outcome: DeliveryOutcome::Terminal,
        });
        let queue = MemoryQueue::spawn("recipient".into(), outbound.clone(), QueueConfig::default());
        queue.enqueue(envelope()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.depth(), 0);
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drops_when_over_max_depth() {
        let outbound = Arc::new(CountingOutbound {
            calls: AtomicUsize::new(0),
            outcome: DeliveryOutcome::Ack,
        });
        let queue = MemoryQueue::spawn(
            "recipient".into(),
            outbound,
            QueueConfig {
                max_depth: 0,
                ..QueueConfig::default()
            },
        );
        queue.enqueue(envelope()).await;
        assert_eq!(queue.depth(), 0);
    }
}
