//! Route handlers (§4.7): thin request/response adapter over
//! [`relay_core::Dispatcher`]. Bodies and responses are the XML documents
//! described in §6; no JSON is spoken at this boundary.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use relay_core::xml::event::{parse_event, render_event};
use relay_core::xml::subscription_set::{parse_subscription_set, render_subscription_set};
use tracing::instrument;

use crate::error::into_response;
use crate::RelayState;

const XML_CONTENT_TYPE: &str = "application/xml";
const LOCATION_KEY_HEADER: HeaderName = HeaderName::from_static("x-set-location-key");
const ACCESS_KEY_HEADER: HeaderName = HeaderName::from_static("x-set-access-key");

fn xml_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

/// `POST /publish` - decode an event envelope, dispatch it, echo the
/// (possibly id-assigned) event back.
#[instrument(skip_all)]
pub async fn post_publish(State(state): State<RelayState>, body: Bytes) -> Response {
    let event = match parse_event(&body) {
        Ok(e) => e,
        Err(e) => return into_response(e.into()),
    };
    match state.dispatcher.dispatch(event) {
        Ok(echoed) => match render_event(&echoed) {
            Ok(doc) => xml_response(StatusCode::OK, doc),
            Err(e) => into_response(e.into()),
        },
        Err(e) => into_response(e),
    }
}

/// `POST /subscribers` - register a new set, or discover an existing one
/// on owner/location collision.
#[instrument(skip_all)]
pub async fn post_subscribers(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let doc = match parse_subscription_set(&body) {
        Ok(d) => d,
        Err(e) => return into_response(e.into()),
    };
    let location_hint = headers
        .get(LOCATION_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let access_key_hint = headers
        .get(ACCESS_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (set, existed) = state.dispatcher.register(location_hint, doc, access_key_hint);
    if existed {
        Response::builder()
            .status(StatusCode::CONFLICT)
            .header(header::CONTENT_LOCATION, format!("/subscribers/{}", set.location))
            .body(axum::body::Body::empty())
            .expect("valid response")
    } else {
        Response::builder()
            .status(StatusCode::CREATED)
            .header(
                header::LOCATION,
                format!("/subscribers/{}?access-key={}", set.location, set.access_key),
            )
            .body(axum::body::Body::empty())
            .expect("valid response")
    }
}

/// `GET /subscribers` - the dispatcher's combined set, no access control
/// (§4.8: public by default).
#[instrument(skip_all)]
pub async fn get_subscribers(State(state): State<RelayState>) -> Response {
    match render_subscription_set(&state.dispatcher.combined_set()) {
        Ok(doc) => xml_response(StatusCode::OK, doc),
        Err(e) => into_response(e.into()),
    }
}

/// `GET /subscribers/{location}` - a specific set, access-key gated.
#[instrument(skip_all, fields(location = %location))]
pub async fn get_subscriber(
    State(state): State<RelayState>,
    Path(location): Path<String>,
    crate::access::AccessKey(access_key): crate::access::AccessKey,
) -> Response {
    match state.dispatcher.get(&location, &access_key) {
        Ok(set) => match render_subscription_set(&set) {
            Ok(doc) => xml_response(StatusCode::OK, doc),
            Err(e) => into_response(e.into()),
        },
        Err(e) => into_response(e),
    }
}

/// `PUT /subscribers/{location}` - replace a set's subscriptions.
#[instrument(skip_all, fields(location = %location))]
pub async fn put_subscriber(
    State(state): State<RelayState>,
    Path(location): Path<String>,
    crate::access::AccessKey(access_key): crate::access::AccessKey,
    body: Bytes,
) -> Response {
    let doc = match parse_subscription_set(&body) {
        Ok(d) => d,
        Err(e) => return into_response(e.into()),
    };
    match state
        .dispatcher
        .replace(&location, &access_key, doc.subscriptions, doc.version)
    {
        Ok(set) => match render_subscription_set(&set) {
            Ok(doc) => xml_response(StatusCode::OK, doc),
            Err(e) => into_response(e.into()),
        },
        Err(e) => into_response(e),
    }
}

/// `DELETE /subscribers/{location}` - idempotent removal.
#[instrument(skip_all, fields(location = %location))]
pub async fn delete_subscriber(
    State(state): State<RelayState>,
    Path(location): Path<String>,
    crate::access::AccessKey(access_key): crate::access::AccessKey,
) -> Response {
    match state.dispatcher.remove(&location, &access_key) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => into_response(e),
    }
}

/// `GET /diagnostics/subscriptions` - every registered set, unauthenticated
/// (operator-facing, not end-client-facing; see §4.9's introspection note).
#[instrument(skip_all)]
pub async fn get_diagnostics(State(state): State<RelayState>) -> Response {
    let sets = state.dispatcher.get_all();
    let mut body = Vec::new();
    body.extend_from_slice(b"<diagnostics queue-count=\"");
    body.extend_from_slice(state.dispatcher.queue_depths().to_string().as_bytes());
    body.extend_from_slice(b"\">\n");
    for set in &sets {
        match render_subscription_set(set) {
            Ok(doc) => {
                body.extend_from_slice(&doc);
                body.push(b'\n');
            }
            Err(e) => {
                tracing::error!(location = %set.location, error = %e, "failed to render set for diagnostics");
            }
        }
    }
    body.extend_from_slice(b"</diagnostics>");
    xml_response(StatusCode::OK, body)
}
