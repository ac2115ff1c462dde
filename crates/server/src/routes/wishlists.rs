//! Wishlist route handlers.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use wishlist_core::{NewWishlist, WishlistId, WishlistPatch};

use super::{ApiJson, ApiPath};
use crate::error::{ApiResponse, Result};
use crate::middleware::CurrentIdentity;
use crate::state::AppState;

/// The caller's own wishlists.
pub async fn index(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
) -> Result<Response> {
    let wishlists = state.service().list_my_wishlists(&identity).await?;
    Ok(ApiResponse::ok(wishlists).into_response())
}

/// Create a wishlist owned by the caller.
pub async fn create(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiJson(input): ApiJson<NewWishlist>,
) -> Result<Response> {
    let metered = state.service().create_wishlist(&identity, input).await?;
    Ok(ApiResponse::created(metered.value)
        .with_quota(metered.quota)
        .into_response())
}

pub async fn show(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiPath(id): ApiPath<WishlistId>,
) -> Result<Response> {
    let wishlist = state.service().get_wishlist(&identity, id).await?;
    Ok(ApiResponse::ok(wishlist).into_response())
}

pub async fn update(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiPath(id): ApiPath<WishlistId>,
    ApiJson(patch): ApiJson<WishlistPatch>,
) -> Result<Response> {
    let wishlist = state.service().update_wishlist(&identity, id, patch).await?;
    Ok(ApiResponse::ok(wishlist).into_response())
}

pub async fn destroy(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiPath(id): ApiPath<WishlistId>,
) -> Result<Response> {
    state.service().delete_wishlist(&identity, id).await?;
    Ok(ApiResponse::ok(()).into_response())
}
