//! The outbound delivery plug: a single `reqwest::Client`, shared process-wide,
//! used both by delivery queues (§4.5) and by the chaining protocol (§4.6).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Error;
use crate::uri::Uri;

/// HTTP method used for an outbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Put,
    Get,
}

/// What a queue's dispatch loop should do after attempting a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx (after following any redirects): drop the envelope.
    Ack,
    /// 408 / 5xx / connect failure / timeout: retry with backoff.
    Retry,
    /// 4xx other than 408: drop the envelope, do not retry.
    Terminal,
}

/// Abstracts the transport so queues and chaining can be tested without a
/// real network. Implemented for [`ReqwestOutbound`] in production.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    async fn send(
        &self,
        recipient: &Uri,
        method: Method,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<DeliveryOutcome, Error>;

    /// Like [`Outbound::send`] but returns the response body, for chaining's
    /// `GET {downstream}/subscribers` call. Only `Method::Get` is meaningful
    /// here.
    async fn fetch(&self, recipient: &Uri) -> Result<Vec<u8>, Error>;

    /// Issues a single request and returns the full response, including
    /// the `Location` header. Used by the chaining protocol, which needs
    /// more than the ack/retry/terminal classification `send` gives the
    /// delivery queues (§4.6: registering with an upstream needs the
    /// `Location` + body the upstream's `POST /subscribers` returns).
    async fn chain_request(
        &self,
        method: Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<HttpResponse, Error>;
}

/// A response from [`Outbound::chain_request`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Production [`Outbound`] backed by a shared `reqwest::Client`.
pub struct ReqwestOutbound {
    client: reqwest::Client,
}

impl ReqwestOutbound {
    /// Builds a client with a bounded redirect policy (§4.5: "follow
    /// redirect up to a small fixed cap; then treat as 5xx") and a
    /// per-request timeout.
    pub fn new(request_timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build http client: {e}")))?;
        Ok(ReqwestOutbound { client })
    }
}

#[async_trait]
impl Outbound for ReqwestOutbound {
    async fn send(
        &self,
        recipient: &Uri,
        method: Method,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<DeliveryOutcome, Error> {
        let reqwest_method = match method {
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Get => reqwest::Method::GET,
        };
        let mut request = self
            .client
            .request(reqwest_method, recipient.to_string())
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => return Ok(DeliveryOutcome::Retry),
            Err(e) => return Err(Error::internal(format!("outbound request failed: {e}"))),
        };

        let status = response.status();
        if status.is_success() {
            Ok(DeliveryOutcome::Ack)
        } else if status.as_u16() == 408 || status.is_server_error() {
            Ok(DeliveryOutcome::Retry)
        } else {
            Ok(DeliveryOutcome::Terminal)
        }
    }

    async fn fetch(&self, recipient: &Uri) -> Result<Vec<u8>, Error> {
        let response = self
            .client
            .get(recipient.to_string())
            .send()
            .await
            .map_err(|e| Error::internal(format!("chaining fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::internal(format!(
                "chaining fetch from {recipient} returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::internal(format!("chaining fetch body read failed: {e}")))
    }

    async fn chain_request(
        &self,
        method: Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<HttpResponse, Error> {
        let reqwest_method = match method {
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Get => reqwest::Method::GET,
        };
        let response = self
            .client
            .request(reqwest_method, uri.to_string())
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| Error::internal(format!("chaining request to {uri} failed: {e}")))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::internal(format!("chaining response body read failed: {e}")))?;
        Ok(HttpResponse { status, location, body })
    }
}
