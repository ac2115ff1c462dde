//! Item route handlers.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use wishlist_core::{ItemId, ItemPatch, NewItem, WishlistId};

use super::{ApiJson, ApiQuery};
use crate::error::{ApiResponse, AppError, Result};
use crate::middleware::CurrentIdentity;
use crate::state::AppState;

/// `?wishlistId=&itemId=`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemQuery {
    pub wishlist_id: WishlistId,
    pub item_id: Option<ItemId>,
}

impl ItemQuery {
    fn require_item(&self) -> Result<ItemId> {
        self.item_id
            .ok_or_else(|| AppError::BadRequest("itemId is required".to_string()))
    }
}

/// List a wishlist's items, or fetch one when `itemId` is given.
pub async fn show(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<ItemQuery>,
) -> Result<Response> {
    let service = state.service();
    Ok(match query.item_id {
        Some(item_id) => ApiResponse::ok(
            service
                .get_item(&identity, query.wishlist_id, item_id)
                .await?,
        )
        .into_response(),
        None => ApiResponse::ok(service.list_items(&identity, query.wishlist_id).await?)
            .into_response(),
    })
}

/// Add an item.
pub async fn create(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<ItemQuery>,
    ApiJson(input): ApiJson<NewItem>,
) -> Result<Response> {
    if query.item_id.is_some() {
        return Err(AppError::BadRequest(
            "itemId is assigned by the server".to_string(),
        ));
    }
    let view = state
        .service()
        .add_item(&identity, query.wishlist_id, input)
        .await?;
    Ok(ApiResponse::created(view).into_response())
}

/// Partially update an item.
pub async fn update(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<ItemQuery>,
    ApiJson(patch): ApiJson<ItemPatch>,
) -> Result<Response> {
    let item_id = query.require_item()?;
    let view = state
        .service()
        .update_item(&identity, query.wishlist_id, item_id, patch)
        .await?;
    Ok(ApiResponse::ok(view).into_response())
}

/// Delete an item.
pub async fn destroy(
    State(state): State<AppState>,
    CurrentIdentity(identity): CurrentIdentity,
    ApiQuery(query): ApiQuery<ItemQuery>,
) -> Result<Response> {
    let item_id = query.require_item()?;
    state
        .service()
        .delete_item(&identity, query.wishlist_id, item_id)
        .await?;
    Ok(ApiResponse::ok(()).into_response())
}
