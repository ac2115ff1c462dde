//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                               - Liveness
//! GET  /health/ready                         - Readiness (store reachable)
//!
//! # Wishlists
//! GET    /api/wishlists                      - Caller's wishlists
//! POST   /api/wishlists                      - Create (quota: wishlist_create)
//! GET    /api/wishlists/{id}                 - Get
//! PATCH  /api/wishlists/{id}                 - Rename / change visibility
//! DELETE /api/wishlists/{id}                 - Delete with items
//!
//! # Items
//! GET    /api/items?wishlistId=              - List
//! GET    /api/items?wishlistId=&itemId=      - Single item
//! POST   /api/items?wishlistId=              - Add
//! PUT    /api/items?wishlistId=&itemId=      - Partial update
//! DELETE /api/items?wishlistId=&itemId=      - Delete
//!
//! # Purchases
//! POST   /api/purchases?itemId=              - Claim (quota: purchase_claim)
//! DELETE /api/purchases?itemId=              - Release
//! GET    /api/purchases?wishlistId=          - Purchases visible to the caller
//! ```

pub mod items;
pub mod purchases;
pub mod wishlists;

use axum::{
    Router,
    extract::{
        FromRequest, FromRequestParts,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    routing::get,
};

use crate::error::AppError;
use crate::state::AppState;

/// JSON body extractor whose rejections use the API envelope.
///
/// Bodies are decoded with the target type's own rules, so types marked
/// `deny_unknown_fields` refuse injected fields such as `ownerId`.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Query string extractor whose rejections use the API envelope.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

/// Path extractor whose rejections use the API envelope.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Create the wishlist routes router.
pub fn wishlist_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(wishlists::index).post(wishlists::create))
        .route(
            "/{id}",
            get(wishlists::show)
                .patch(wishlists::update)
                .delete(wishlists::destroy),
        )
}

/// Create all API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/api/wishlists", wishlist_routes())
        .route(
            "/api/items",
            get(items::show)
                .post(items::create)
                .put(items::update)
                .delete(items::destroy),
        )
        .route(
            "/api/purchases",
            get(purchases::index)
                .post(purchases::claim)
                .delete(purchases::release),
        )
}
