//! Per-recipient dispatch queues (§4.5) and the repository that looks them
//! up by recipient identity (§4.1 of the component table / §4.5-4.6 use).

pub mod memory;
pub mod persistent;
pub mod repository;

pub use repository::QueueRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::outbound::Method;
use crate::subscription::Cookie;
use crate::uri::Uri;

/// Maximum envelopes held per queue before new enqueues are dropped with a
/// warning (§4.4 backpressure).
pub const DEFAULT_MAX_DEPTH: usize = 1_000;

/// One pending delivery attempt: a fully-dressed request ready to send to
/// `recipient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    pub event_id: String,
    pub channel: String,
    pub recipient: Uri,
    pub cookies: Vec<Cookie>,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

// `Method` lives in `crate::outbound`; give it serde support here so
// envelopes can round-trip through the persistent queue without pulling a
// serde dependency into `outbound`.
impl Serialize for Method {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Get => "GET",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "GET" => Ok(Method::Get),
            other => Err(serde::de::Error::custom(format!("unknown method {other}"))),
        }
    }
}

/// Observable state of a queue's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Delivering,
    Retrying { attempt: u32 },
    Dead,
}

/// Exponential backoff starting at `initial`, doubling per attempt, capped
/// at `ceiling`. `attempt` is 1 on the first retry.
pub(crate) fn backoff_delay(
    initial: std::time::Duration,
    attempt: u32,
    ceiling: std::time::Duration,
) -> std::time::Duration {
    let scaled = initial.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    scaled.min(ceiling)
}

/// A per-recipient FIFO with its own background dispatch loop. Both
/// [`memory::MemoryQueue`] and [`persistent::PersistentQueue`] implement
/// this; callers only ever hold `Arc<dyn Queue>`.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Appends `envelope` to the back of the queue. Drops it (logging a
    /// warning) if the queue is over its configured depth.
    async fn enqueue(&self, envelope: QueuedEnvelope);

    /// Current dispatch-loop state.
    fn state(&self) -> QueueState;

    /// Number of envelopes currently queued (including one in flight).
    fn depth(&self) -> usize;

    /// Stops the background dispatch loop without draining (§5: "Stop
    /// drains no queues").
    fn shutdown(&self);

    /// Stops the dispatch loop the same way [`Queue::shutdown`] does, but
    /// leaves [`Queue::state`] reporting [`QueueState::Dead`] rather than
    /// whatever state it was last in, so a caller that still holds this
    /// `Arc` after the repository drops it sees why delivery stopped
    /// (reaped for having no live subscriber, §4.9).
    fn mark_dead(&self);
}
