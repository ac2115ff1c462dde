//! Request correlation ids.
//!
//! An `x-request-id` from the fronting proxy is kept when it is short
//! visible ASCII; anything else is replaced by a fresh UUID v4. The id is
//! stored as a [`RequestId`] extension, recorded on the `http_request`
//! span, tagged on the Sentry scope and echoed on the response.

use std::fmt;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Span;
use uuid::Uuid;

/// The HTTP header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest upstream id accepted as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the request being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(HeaderValue);

impl RequestId {
    /// Reuse the upstream id in `headers` if acceptable, else mint one.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .filter(|value| is_acceptable(value.as_bytes()))
            .cloned()
            .map_or_else(Self::generate, Self)
    }

    fn generate() -> Self {
        let id = Uuid::new_v4().hyphenated().to_string();
        // A hyphenated UUID is always a valid header value.
        Self(HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("unknown")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or_default()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_acceptable(id: &[u8]) -> bool {
    !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN && id.iter().all(u8::is_ascii_graphic)
}

/// Middleware that gives every request a [`RequestId`].
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_headers(request.headers());

    Span::current().record("request_id", request_id.as_str());
    sentry::configure_scope(|scope| {
        scope.set_tag("request_id", &request_id);
    });
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, request_id.0);
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{Extension, Router, body::Body, middleware::from_fn, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn with_id(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(id).unwrap());
        headers
    }

    #[test]
    fn test_upstream_id_is_kept() {
        let id = RequestId::from_headers(&with_id("cf-8a1b2c3d:edge-42"));
        assert_eq!(id.as_str(), "cf-8a1b2c3d:edge-42");
    }

    #[test]
    fn test_missing_or_unusable_ids_are_replaced() {
        let too_long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        for headers in [HeaderMap::new(), with_id(""), with_id("two words"), with_id(&too_long)] {
            let id = RequestId::from_headers(&headers);
            assert!(Uuid::parse_str(id.as_str()).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_generated_ids_differ() {
        let headers = HeaderMap::new();
        assert_ne!(
            RequestId::from_headers(&headers),
            RequestId::from_headers(&headers)
        );
    }

    #[tokio::test]
    async fn test_middleware_exposes_and_echoes_id() {
        let app = Router::new()
            .route(
                "/",
                get(|Extension(id): Extension<RequestId>| async move { id.to_string() }),
            )
            .layer(from_fn(request_id_middleware));

        let request = axum::http::Request::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "trace-77")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-77");
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(body.as_ref(), b"trace-77");
    }
}
