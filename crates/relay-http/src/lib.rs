//! Axum adapter exposing a [`relay_core::Dispatcher`] over the HTTP surface
//! described in §4.7/§6: `/publish`, `/subscribers*`, and
//! `/diagnostics/subscriptions`.

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use relay_core::Dispatcher;

mod access;
mod error;
mod handlers;

use handlers::*;

/// Shared axum state: just the dispatcher, cheaply cloned per request via
/// its inner `Arc`.
#[derive(Clone)]
pub struct RelayState {
    dispatcher: Arc<Dispatcher>,
}

/// Builds the router for a relay instance backed by `dispatcher`.
pub fn create_relay_router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = RelayState { dispatcher };

    Router::new()
        .route("/publish", post(post_publish))
        .route("/subscribers", post(post_subscribers).get(get_subscribers))
        .route(
            "/subscribers/{location}",
            get(get_subscriber).put(put_subscriber).delete(delete_subscriber),
        )
        .route("/diagnostics/subscriptions", get(get_diagnostics))
        .with_state(state)
}

// re-exported so relay-server doesn't need a direct relay-core dependency
// just to pass a Dispatcher around.
pub use relay_core::Dispatcher as RelayDispatcher;

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::queue::memory::QueueConfig;
    use relay_core::queue::QueueRepository;
    use relay_core::outbound::{DeliveryOutcome, Outbound};
    use relay_core::{Error, Uri};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct NoopOutbound;

    #[async_trait]
    impl Outbound for NoopOutbound {
        async fn send(
            &self,
            _recipient: &Uri,
            _method: relay_core::outbound::Method,
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
            _method: relay_core::outbound::Method,
            _uri: &Uri,
            _body: &[u8],
        ) -> Result<relay_core::outbound::HttpResponse, Error> {
            Ok(relay_core::outbound::HttpResponse {
                status: 200,
                location: None,
                body: Vec::new(),
            })
        }
    }

    fn router() -> Router {
        let queues = QueueRepository::memory(Arc::new(NoopOutbound), QueueConfig::default());
        let dispatcher = Dispatcher::new("pubsub://relay-1".parse().unwrap(), queues);
        create_relay_router(dispatcher)
    }

    #[tokio::test]
    async fn publish_on_reserved_scheme_is_forbidden() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/publish")
                    .body(Body::from(
                        r#"<event channel="pubsub://x/y"></event>"#.to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn register_then_get_combined_set() {
        let app = router();
        let register_body = r#"<subscription-set>
            <uri.owner>http://client/cb</uri.owner>
            <subscription id="s1">
                <channel>http://evt/a/*</channel>
                <recipient><uri>http://r/sink</uri></recipient>
            </subscription>
        </subscription-set>"#;

        let register_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/subscribers")
                    .body(Body::from(register_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(register_response.status(), StatusCode::CREATED);

        let combined_response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/subscribers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(combined_response.status(), StatusCode::OK);
    }
}
