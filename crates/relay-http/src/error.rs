//! Maps [`relay_core::Error`] onto an HTTP status, the way
//! `cdk-axum::router_handlers::into_response` maps `cdk::Error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::Error;

pub fn into_response(error: Error) -> Response {
    let status = match &error {
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotModified => StatusCode::NOT_MODIFIED,
        Error::AbortedFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::ParseArgument { .. } => StatusCode::BAD_REQUEST,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if error.is_fatal() {
        tracing::error!(error = %error, "aborting request processing");
    }
    (status, error.to_string()).into_response()
}
