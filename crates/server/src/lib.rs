//! Wishlist access and purchase-coordination server.
//!
//! This crate provides the API as a library so the router can be exercised
//! in-process by tests and reused by the CLI.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

use axum::{
    Router,
    extract::State,
    http::{Request, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router.
///
/// API routes pass through, outermost first: edge rate limiting, identity
/// resolution, then the per-role request quota. Health checks skip all
/// three. Serve with `into_make_service_with_connect_info::<SocketAddr>()`
/// so anonymous callers are keyed on their peer address.
pub fn app(state: AppState) -> Router {
    let api = routes::routes().layer(
        ServiceBuilder::new()
            .layer(middleware::edge_rate_limiter(state.config().trust_proxy_headers))
            .layer(from_fn_with_state(state.clone(), middleware::resolve_identity))
            .layer(from_fn_with_state(state.clone(), middleware::request_quota)),
    );

    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .merge(api)
        .layer(from_fn(middleware::request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = tracing::field::Empty,
                    role = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction())
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// Verifies the document store answers within its timeout.
/// Returns 503 Service Unavailable otherwise.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.documents().list("health:").await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
