//! Upstream/downstream chaining (§4.6): mirrors subscription-set changes
//! between this dispatcher and configured peers so that an event published
//! anywhere in the topology reaches its subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::outbound::{HttpResponse, Method, Outbound};
use crate::subscription::Subscription;
use crate::subscription_set::SubscriptionSet;
use crate::uri::Uri;
use crate::xml::subscription_set::{parse_subscription_set, render_subscription_set};

/// Bounded retry policy for chaining's startup calls (§4.6: "up to 3
/// attempts, 500ms between attempts, then give up and log").
#[derive(Debug, Clone, Copy)]
pub struct ChainingRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ChainingRetry {
    fn default() -> Self {
        ChainingRetry {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Drives chaining registration for every configured peer. Each peer is
/// handled independently and failures are logged, not propagated: a
/// misconfigured or unreachable peer should not prevent the dispatcher
/// from serving local traffic.
pub async fn start_chaining(
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<dyn Outbound>,
    upstream: Vec<Uri>,
    downstream: Vec<Uri>,
    retry: ChainingRetry,
) {
    let stop = dispatcher.shutdown_flag();

    for peer in upstream {
        let dispatcher = dispatcher.clone();
        let outbound = outbound.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) =
                register_with_upstream(&dispatcher, outbound.as_ref(), &peer, retry, &stop).await
            {
                if !stop.load(Ordering::SeqCst) {
                    tracing::warn!(peer = %peer, error = %e, "giving up on upstream chaining");
                }
            }
        });
    }
    for peer in downstream {
        let dispatcher = dispatcher.clone();
        let outbound = outbound.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) =
                mirror_to_downstream(&dispatcher, outbound.as_ref(), &peer, retry, &stop).await
            {
                if !stop.load(Ordering::SeqCst) {
                    tracing::warn!(peer = %peer, error = %e, "giving up on downstream chaining");
                }
            }
        });
    }
}

async fn with_retry<F, Fut, T>(retry: ChainingRetry, stop: &AtomicBool, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = Error::internal("retry loop ran zero times");
    for try_index in 0..retry.attempts {
        if stop.load(Ordering::SeqCst) {
            return Err(Error::internal("chaining stopped during shutdown"));
        }
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = e;
                if try_index + 1 < retry.attempts {
                    tokio::time::sleep(retry.delay).await;
                }
            }
        }
    }
    Err(last_err)
}

fn subscribers_uri(peer: &Uri) -> Uri {
    let mut segments = peer.segments().to_vec();
    segments.push("subscribers".to_string());
    Uri::from_parts(peer.scheme(), peer.hostport(), segments)
}

/// Registers an empty set with `upstream` to obtain its `location` +
/// access key, then locally subscribes `pubsub://*/*` to that location so
/// every future local registry change replays to upstream as a `PUT
/// /subscribers/{location}`.
async fn register_with_upstream(
    dispatcher: &Dispatcher,
    outbound: &dyn Outbound,
    upstream: &Uri,
    retry: ChainingRetry,
    stop: &AtomicBool,
) -> Result<()> {
    let target = subscribers_uri(upstream);
    let response = with_retry(retry, stop, || async {
        let empty = SubscriptionSet::new(dispatcher.self_uri().clone());
        let body = render_subscription_set(&empty)?;
        let response = outbound.chain_request(Method::Post, &target, &body).await?;
        if !response.is_success() {
            return Err(Error::internal(format!(
                "upstream {target} returned status {}",
                response.status
            )));
        }
        Ok(response)
    })
    .await?;

    let recipient = recipient_from_register_response(upstream, &response)?;
    dispatcher.register_chain_subscription(
        upstream.clone(),
        Subscription {
            id: "chain-upstream".to_string(),
            channel: Uri::from_parts("pubsub", "*", vec!["*".to_string()]),
            resource: None,
            recipients: vec![recipient],
            cookies: Vec::new(),
            proxy: None,
        },
    );
    tracing::info!(peer = %upstream, "registered with upstream");
    Ok(())
}

fn recipient_from_register_response(upstream: &Uri, response: &HttpResponse) -> Result<Uri> {
    let location = response.location.clone().ok_or_else(|| {
        Error::internal(format!("upstream {upstream} register response had no Location header"))
    })?;
    let absolute = if location.contains("://") {
        location
    } else {
        format!("{}://{}{}", upstream.scheme(), upstream.hostport(), location)
    };
    absolute
        .parse()
        .map_err(|_| Error::internal(format!("upstream {upstream} returned an invalid Location: {absolute}")))
}

/// GETs `downstream`'s combined set, registers it locally, then POSTs a
/// mirror subscription-set back to `downstream` so its future
/// combined-set changes are replayed to us.
async fn mirror_to_downstream(
    dispatcher: &Dispatcher,
    outbound: &dyn Outbound,
    downstream: &Uri,
    retry: ChainingRetry,
    stop: &AtomicBool,
) -> Result<()> {
    let target = subscribers_uri(downstream);

    let combined_bytes = with_retry(retry, stop, || async {
        let response = outbound.chain_request(Method::Get, &target, &[]).await?;
        if !response.is_success() {
            return Err(Error::internal(format!(
                "downstream {target} returned status {}",
                response.status
            )));
        }
        Ok(response.body)
    })
    .await?;

    let mut remote_set = parse_subscription_set(&combined_bytes)?;
    remote_set.owner = downstream.clone();
    dispatcher.register(None, remote_set, None);

    let mirror_recipient = Uri::from_parts(
        "pubsub",
        dispatcher.self_uri().hostport(),
        vec!["changes".to_string()],
    );
    let mut mirror = SubscriptionSet::new(dispatcher.self_uri().clone());
    mirror.subscriptions.push(Subscription {
        id: "chain-downstream".to_string(),
        channel: Uri::from_parts("pubsub", "*", vec!["*".to_string()]),
        resource: None,
        recipients: vec![mirror_recipient],
        cookies: Vec::new(),
        proxy: None,
    });
    let mirror_body = render_subscription_set(&mirror)?;

    with_retry(retry, stop, || async {
        let response = outbound.chain_request(Method::Post, &target, &mirror_body).await?;
        if !response.is_success() {
            return Err(Error::internal(format!(
                "downstream {target} rejected mirror registration with status {}",
                response.status
            )));
        }
        Ok(())
    })
    .await?;

    tracing::info!(peer = %downstream, "mirrored downstream combined set");
    Ok(())
}
