//! Configuration types shared by `relay-server` and, transitively, this
//! crate's dispatcher/queue construction (§6 "Configuration options").
//!
//! `relay-server` loads this via the `config` crate (TOML file + `RELAY_`
//! environment overrides); this type itself has no dependency on `config`
//! so it can also be constructed directly in tests.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::uri::Uri;

fn default_failed_dispatch_retry() -> u64 {
    60
}

fn default_listen_addr() -> String {
    "127.0.0.1:8085".to_string()
}

fn default_reaper_grace_period() -> u64 {
    300
}

/// Top-level settings. Every field besides `self-uri` is optional; the
/// dispatcher runs standalone (no chaining, memory-backed queues) with an
/// empty configuration besides that.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// This dispatcher's own identity, used as the owner of the combined
    /// set and as the `scheme://hostport` half of the reserved
    /// `pubsub://<self>/changes` channel, and to populate `via` for loop
    /// breaking.
    pub self_uri: String,

    /// Address the HTTP adapter binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory for persistent per-recipient queues. Memory queues are
    /// used when absent.
    #[serde(default)]
    pub queue_path: Option<PathBuf>,

    /// Initial retry backoff, in seconds, for failed deliveries.
    #[serde(default = "default_failed_dispatch_retry")]
    pub failed_dispatch_retry: u64,

    /// Peer URIs this dispatcher subscribes to on start (§4.6).
    #[serde(default)]
    pub upstream: Vec<String>,

    /// Peer URIs made to subscribe to this dispatcher on start (§4.6).
    #[serde(default)]
    pub downstream: Vec<String>,

    /// Grace period, in seconds, a recipient may go unsubscribed before its
    /// queue is reaped (§4.9 background reaper).
    #[serde(default = "default_reaper_grace_period")]
    pub reaper_grace_period: u64,
}

impl RelayConfig {
    /// Parses `self_uri` and the peer URI lists, surfacing any malformed
    /// entry as `BadRequest` rather than panicking deep inside startup.
    pub fn self_uri(&self) -> Result<Uri> {
        self.self_uri
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid self-uri: {}", self.self_uri)))
    }

    pub fn upstream_uris(&self) -> Result<Vec<Uri>> {
        self.upstream
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::BadRequest(format!("invalid upstream uri: {s}")))
            })
            .collect()
    }

    pub fn downstream_uris(&self) -> Result<Vec<Uri>> {
        self.downstream
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::BadRequest(format!("invalid downstream uri: {s}")))
            })
            .collect()
    }

    pub fn failed_dispatch_retry(&self) -> Duration {
        Duration::from_secs(self.failed_dispatch_retry)
    }

    pub fn reaper_grace_period(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_only_self_uri_given() {
        let cfg = RelayConfig {
            self_uri: "pubsub://relay-1".into(),
            listen_addr: default_listen_addr(),
            queue_path: None,
            failed_dispatch_retry: default_failed_dispatch_retry(),
            upstream: Vec::new(),
            downstream: Vec::new(),
            reaper_grace_period: default_reaper_grace_period(),
        };
        assert_eq!(cfg.failed_dispatch_retry(), Duration::from_secs(60));
        assert!(cfg.upstream_uris().unwrap().is_empty());
        assert_eq!(cfg.self_uri().unwrap().scheme(), "pubsub");
    }
}
