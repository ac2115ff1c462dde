//! Purchase route handlers.
//!
//! Claim responses carry the caller's remaining `purchase_claim` allowance.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use wishlist_core::{ItemId, WishlistId};

use super::ApiQuery;
use crate::error::{ApiResponse, Result};
use crate::middleware::CurrentIdentity;
use crate::state::AppState;

/// `?itemId=`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseQuery {
    pub item_id: ItemId,
}

/// `?wishlistId=`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseListQuery {
    pub wishlist_id: WishlistId,
}

/// Claim an item. `201` for a new claim, `200` when the caller already held it.
pub async fn claim(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<PurchaseQuery>,
) -> Result<Response> {
    let metered = state
        .service()
        .claim_purchase(&identity, query.item_id)
        .await?;
    let is_new = metered.value.is_new();
    let purchase = metered.value.into_purchase();
    let response = if is_new {
        ApiResponse::created(purchase)
    } else {
        ApiResponse::ok(purchase)
    };
    Ok(response.with_quota(metered.quota).into_response())
}

/// Release the caller's claim (or any claim, for a moderating admin).
pub async fn release(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<PurchaseQuery>,
) -> Result<Response> {
    let purchase = state
        .service()
        .release_purchase(&identity, query.item_id)
        .await?;
    Ok(ApiResponse::ok(purchase).into_response())
}

/// Purchases on a wishlist visible to the caller.
pub async fn index(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<PurchaseListQuery>,
) -> Result<Response> {
    let purchases = state
        .service()
        .list_purchases(&identity, query.wishlist_id)
        .await?;
    Ok(ApiResponse::ok(purchases).into_response())
}
