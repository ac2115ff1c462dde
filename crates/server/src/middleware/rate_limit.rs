//! Rate limiting.
//!
//! Two layers:
//! - [`edge_rate_limiter`]: per-IP token bucket (`governor`), ahead of identity
//!   resolution, so unauthenticated floods are cut off cheaply
//! - [`request_quota`]: per-caller windowed quota from the request ledger,
//!   tiered by role, after identity resolution. Anonymous callers are keyed
//!   by client IP.
//!
//! The client IP is the TCP peer address unless proxy headers are trusted
//! (`WISHLIST_TRUST_PROXY_HEADERS`), in which case [`forwarded_ip`] wins and
//! the peer is the fallback. Both layers need the router served with
//! `into_make_service_with_connect_info::<SocketAddr>()`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Extensions, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::clock::QuantaInstant;
use governor::middleware::NoOpMiddleware;
use tower_governor::{GovernorError, GovernorLayer, governor::GovernorConfigBuilder};
use wishlist_core::Identity;

use crate::error::AppError;
use crate::services::{QuotaClass, QuotaDecision, QuotaRejection, ServiceError};
use crate::state::AppState;

// =============================================================================
// Client Address
// =============================================================================

/// Client IP from proxy headers: `CF-Connecting-IP`, the first
/// `X-Forwarded-For` hop, `X-Real-IP`, then `Fly-Client-IP`.
#[must_use]
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    header("cf-connecting-ip")
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|s| s.split(',').next())
                .and_then(|s| s.trim().parse().ok())
        })
        .or_else(|| header("x-real-ip").and_then(|s| s.trim().parse().ok()))
        .or_else(|| header("fly-client-ip").and_then(|s| s.trim().parse().ok()))
}

/// Address the request is counted against.
///
/// Never fails: without headers or a peer address every such request
/// shares the unspecified address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_proxy_headers: bool) -> IpAddr {
    let peer = || {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };
    trust_proxy_headers
        .then(|| forwarded_ip(headers))
        .flatten()
        .or_else(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Key extractor for the edge limiter, using [`client_ip`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKeyExtractor {
    trust_proxy_headers: bool,
}

impl ClientIpKeyExtractor {
    #[must_use]
    pub const fn new(trust_proxy_headers: bool) -> Self {
        Self { trust_proxy_headers }
    }
}

impl tower_governor::key_extractor::KeyExtractor for ClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &axum::http::Request<T>) -> Result<Self::Key, GovernorError> {
        Ok(client_ip(
            req.headers(),
            req.extensions(),
            self.trust_proxy_headers,
        ))
    }
}

// =============================================================================
// Edge Limiter
// =============================================================================

/// Rate limiter layer type for Axum.
pub type RateLimiterLayer =
    GovernorLayer<ClientIpKeyExtractor, NoOpMiddleware<QuantaInstant>, axum::body::Body>;

/// Per-IP limiter for the whole API: ~20 requests per second, burst of 100.
///
/// This sits above the request ledger's per-role limits and only stops
/// floods; normal clients never reach it. Refusals use the API envelope.
///
/// # Panics
///
/// This function will not panic. The configuration uses only valid positive
/// integers (`per_millisecond(50)` and `burst_size(100)`), which are always
/// accepted by `GovernorConfigBuilder`.
#[must_use]
pub fn edge_rate_limiter(trust_proxy_headers: bool) -> RateLimiterLayer {
    let config = GovernorConfigBuilder::default()
        .key_extractor(ClientIpKeyExtractor::new(trust_proxy_headers))
        .per_millisecond(50)
        .burst_size(100)
        .finish()
        .expect("rate limiter config with per_millisecond(50) and burst_size(100) is valid");
    GovernorLayer::new(Arc::new(config)).error_handler(edge_refusal)
}

/// Render a governor refusal as an API error.
fn edge_refusal(error: GovernorError) -> Response {
    let err = match error {
        GovernorError::TooManyRequests { wait_time, .. } => {
            tracing::info!(wait_secs = wait_time, "Edge rate limit hit");
            AppError::Throttled {
                wait_secs: wait_time,
            }
        }
        other => AppError::Internal(other.to_string()),
    };
    err.into_response()
}

// =============================================================================
// Request Ledger
// =============================================================================

/// Subject the request ledger counts against.
fn subject(identity: &Identity, ip: IpAddr) -> String {
    identity
        .user_id()
        .map_or_else(|| format!("ip:{ip}"), |user| format!("user:{user}"))
}

/// Middleware enforcing the per-role request quota.
///
/// Runs after [`super::auth::resolve_identity`]. Store failures are logged
/// and the request is let through.
pub async fn request_quota(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = request
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or_default();
    let class = QuotaClass::Requests(identity.role());
    let ip = client_ip(
        request.headers(),
        request.extensions(),
        state.config().trust_proxy_headers,
    );
    let subject = subject(&identity, ip);

    match state
        .request_ledger()
        .check_and_increment(&subject, class, state.clock().now())
        .await
    {
        Ok(QuotaDecision::Accepted(_)) => next.run(request).await,
        Ok(QuotaDecision::Rejected(status)) => {
            tracing::info!(class = %class, "Request quota exhausted");
            AppError::from(ServiceError::RateLimitExceeded(QuotaRejection { class, status }))
                .into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Request ledger unavailable, allowing request");
            next.run(request).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::{HeaderValue, StatusCode, header};
    use http_body_util::BodyExt;
    use tower_governor::key_extractor::KeyExtractor;
    use wishlist_core::UserId;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer(addr: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        extensions
    }

    #[test]
    fn test_forwarded_ip_prefers_cloudflare() {
        let map = headers(&[
            ("cf-connecting-ip", "203.0.113.7"),
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
        ]);
        assert_eq!(forwarded_ip(&map), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_ip_uses_first_hop() {
        let map = headers(&[("x-forwarded-for", "198.51.100.1, 10.0.0.1")]);
        assert_eq!(forwarded_ip(&map), Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_ip_missing() {
        assert_eq!(forwarded_ip(&HeaderMap::new()), None);
        assert_eq!(forwarded_ip(&headers(&[("x-real-ip", "nonsense")])), None);
    }

    #[test]
    fn test_client_ip_ignores_headers_unless_trusted() {
        let map = headers(&[("x-forwarded-for", "198.51.100.1")]);
        let ext = peer("192.0.2.9:51000");
        assert_eq!(client_ip(&map, &ext, false), "192.0.2.9".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&map, &ext, true), "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_ip_falls_back_to_peer_then_unspecified() {
        let ext = peer("[2001:db8::5]:443");
        assert_eq!(
            client_ip(&HeaderMap::new(), &ext, true),
            "2001:db8::5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), &Extensions::new(), true),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_key_extractor_never_fails() {
        let request = axum::http::Request::builder().body(()).unwrap();
        let key = ClientIpKeyExtractor::new(false).extract(&request).unwrap();
        assert_eq!(key, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_edge_refusal_uses_envelope() {
        let response = edge_refusal(GovernorError::TooManyRequests {
            wait_time: 3,
            headers: None,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["data"].is_null());
        assert_eq!(body["error"]["kind"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_subject_keys() {
        let ip: IpAddr = "192.0.2.4".parse().unwrap();
        assert_eq!(subject(&Identity::anonymous(), ip), "ip:192.0.2.4");
        assert_eq!(
            subject(&Identity::user(UserId::parse("bob").unwrap()), ip),
            "user:bob"
        );
    }
}
