//! Access-key extraction for per-location endpoints (§4.8): a client
//! presents the set's access key either as a `?access-key=` query
//! parameter or as an `access-key` cookie.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

/// The access key presented on the request, if any. An absent key is not
/// itself a rejection - whether it's sufficient depends on the operation
/// (`Registry::get`/`replace`/`remove` require an exact match against the
/// set's key, so an empty key only succeeds against a set with an empty
/// key, which never happens for a server-generated one).
pub struct AccessKey(pub String);

impl<S> FromRequestParts<S> for AccessKey
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(query) = parts.uri.query() {
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    if k == "access-key" {
                        return Ok(AccessKey(v.to_string()));
                    }
                }
            }
        }

        if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookie_header = cookie_header.to_str().map_err(|_| {
                (StatusCode::BAD_REQUEST, "invalid Cookie header".to_string())
            })?;
            for cookie in cookie_header.split(';') {
                let cookie = cookie.trim();
                if let Some((k, v)) = cookie.split_once('=') {
                    if k == "access-key" {
                        return Ok(AccessKey(v.to_string()));
                    }
                }
            }
        }

        Ok(AccessKey(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> AccessKey {
        let (mut parts, _) = req.into_parts();
        AccessKey::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn reads_from_query_param() {
        let req = Request::builder()
            .uri("/subscribers/abc?access-key=s3cr3t")
            .body(())
            .unwrap();
        assert_eq!(extract(req).await.0, "s3cr3t");
    }

    #[tokio::test]
    async fn reads_from_cookie() {
        let req = Request::builder()
            .uri("/subscribers/abc")
            .header("cookie", "other=1; access-key=s3cr3t")
            .body(())
            .unwrap();
        assert_eq!(extract(req).await.0, "s3cr3t");
    }

    #[tokio::test]
    async fn defaults_to_empty_when_absent() {
        let req = Request::builder().uri("/subscribers/abc").body(()).unwrap();
        assert_eq!(extract(req).await.0, "");
    }
}
