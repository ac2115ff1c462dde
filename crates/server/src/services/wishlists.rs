//! Wishlist service: the single entry point for wishlist, item, and
//! purchase operations.
//!
//! Every operation takes the caller's [`Identity`], loads the state the
//! policy needs, evaluates it, and only then touches anything else.
//! Quota-bound operations consult the action ledger after the policy and
//! before any write.
//!
//! Item views are shaped per caller: non-owners see a `claim` summary,
//! owners never see the field at all, whatever the policy says.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use wishlist_core::policy::{self, Request};
use wishlist_core::{
    Identity, Item, ItemId, ItemPatch, NewItem, NewWishlist, Purchase, UserId, Wishlist,
    WishlistId, WishlistPatch,
};

use super::claims::{Claim, ClaimCoordinator, ClaimError, ClaimLedger};
use super::clock::Clock;
use super::error::{QuotaRejection, Resource, Result, ServiceError};
use super::quota::{QuotaClass, QuotaDecision, QuotaLedger, QuotaStatus};
use crate::db::{Documents, Precondition, StoreError, Versioned, keys};

/// Attempts at appending to or removing from an index document.
const INDEX_ATTEMPTS: usize = 4;

/// Per-owner and per-wishlist ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceLimits {
    pub max_items_per_wishlist: usize,
    pub max_wishlists_per_user: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_items_per_wishlist: 100,
            max_wishlists_per_user: 50,
        }
    }
}

/// Ids of the wishlists a user owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerIndex {
    owner_id: UserId,
    #[serde(default)]
    wishlist_ids: Vec<WishlistId>,
}

/// Claim summary shown to non-owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimView {
    pub claimed: bool,
    pub claimed_by_you: bool,
}

/// An item as returned to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    #[serde(flatten)]
    pub item: Item,
    /// Absent for the wishlist owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimView>,
}

/// A result that consumed quota, with the allowance left afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metered<T> {
    pub value: T,
    pub quota: QuotaStatus,
}

/// Wishlist, item, and purchase operations over a shared document store.
#[derive(Clone)]
pub struct WishlistService {
    docs: Documents,
    claims: ClaimCoordinator,
    quota: QuotaLedger,
    clock: Arc<dyn Clock>,
    limits: ServiceLimits,
}

impl WishlistService {
    #[must_use]
    pub fn new(
        docs: Documents,
        quota: QuotaLedger,
        clock: Arc<dyn Clock>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            claims: ClaimCoordinator::new(docs.clone()),
            docs,
            quota,
            clock,
            limits,
        }
    }

    #[must_use]
    pub const fn claims(&self) -> &ClaimCoordinator {
        &self.claims
    }

    // =========================================================================
    // Wishlists
    // =========================================================================

    /// Create a wishlist owned by the caller.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired` for anonymous callers, `Validation` for bad
    /// fields, `RateLimitExceeded` when the creation quota is spent,
    /// `LimitExceeded` at the per-owner ceiling.
    #[instrument(skip(self, identity, input), fields(role = %identity.role()))]
    pub async fn create_wishlist(
        &self,
        identity: &Identity,
        input: NewWishlist,
    ) -> Result<Metered<Wishlist>> {
        policy::evaluate(identity, Request::CreateWishlist).into_result()?;
        let owner = caller(identity)?;
        let now = self.clock.now();
        let wishlist = Wishlist::create(owner.clone(), input, now)?;

        let quota = self
            .spend_quota(owner, QuotaClass::WishlistCreate)
            .await?;

        let max = self.limits.max_wishlists_per_user;
        let wishlist_id = wishlist.id;
        self.modify(&keys::owner(owner), |index: Option<OwnerIndex>| {
            let mut index = index.unwrap_or_else(|| OwnerIndex {
                owner_id: owner.clone(),
                wishlist_ids: Vec::new(),
            });
            if index.wishlist_ids.len() >= max {
                return Err(ServiceError::LimitExceeded(format!(
                    "a user may own at most {max} wishlists"
                )));
            }
            index.wishlist_ids.push(wishlist_id);
            Ok(index)
        })
        .await?;

        if let Err(e) = self
            .docs
            .save(&keys::wishlist(wishlist.id), Precondition::Absent, &wishlist)
            .await
        {
            self.unlist_wishlist(owner, wishlist.id).await;
            return Err(e.into());
        }

        tracing::info!(wishlist_id = %wishlist.id, "Wishlist created");
        Ok(Metered {
            value: wishlist,
            quota,
        })
    }

    /// Fetch a wishlist the caller may read.
    ///
    /// # Errors
    ///
    /// `NotFound`, or the read denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id))]
    pub async fn get_wishlist(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
    ) -> Result<Wishlist> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::ReadWishlist(&wishlist)).into_result()?;
        Ok(wishlist)
    }

    /// Wishlists owned by the caller, in creation order.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired` for anonymous callers.
    #[instrument(skip(self, identity))]
    pub async fn list_my_wishlists(&self, identity: &Identity) -> Result<Vec<Wishlist>> {
        let owner = caller(identity)?;
        let Some(index) = self.docs.load::<OwnerIndex>(&keys::owner(owner)).await? else {
            return Ok(Vec::new());
        };

        let mut wishlists = Vec::with_capacity(index.value.wishlist_ids.len());
        for id in index.value.wishlist_ids {
            match self.docs.load::<Wishlist>(&keys::wishlist(id)).await? {
                Some(w) => wishlists.push(w.value),
                None => tracing::warn!(wishlist_id = %id, "Owner index points at missing wishlist"),
            }
        }
        Ok(wishlists)
    }

    /// Rename a wishlist or change its visibility.
    ///
    /// # Errors
    ///
    /// `NotFound`, the manage denial, `Validation`, or `Conflict` if the
    /// wishlist changed since it was read.
    #[instrument(skip(self, identity, patch), fields(wishlist_id = %wishlist_id))]
    pub async fn update_wishlist(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
        patch: WishlistPatch,
    ) -> Result<Wishlist> {
        let read = self.load_wishlist(wishlist_id).await?;
        policy::evaluate(identity, Request::UpdateWishlist(&read.value)).into_result()?;

        let mut wishlist = read.value;
        wishlist.apply(patch, self.clock.now())?;
        self.docs
            .save(
                &keys::wishlist(wishlist_id),
                Precondition::Matches(read.version),
                &wishlist,
            )
            .await?;

        tracing::info!("Wishlist updated");
        Ok(wishlist)
    }

    /// Delete a wishlist and its items. Claim ledgers are kept.
    ///
    /// # Errors
    ///
    /// `NotFound` or the manage denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id))]
    pub async fn delete_wishlist(&self, identity: &Identity, wishlist_id: WishlistId) -> Result<()> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::DeleteWishlist(&wishlist)).into_result()?;

        // Removing the wishlist document first makes every item unreachable.
        self.docs.delete(&keys::wishlist(wishlist_id)).await?;
        for item_id in &wishlist.item_ids {
            if let Err(e) = self.docs.delete(&keys::item(*item_id)).await {
                tracing::warn!(item_id = %item_id, error = %e, "Failed to delete orphaned item");
            }
        }
        self.unlist_wishlist(&wishlist.owner_id, wishlist_id).await;

        tracing::info!(items = wishlist.item_ids.len(), "Wishlist deleted");
        Ok(())
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// Items on a wishlist, in insertion order.
    ///
    /// # Errors
    ///
    /// `NotFound` or the read denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id))]
    pub async fn list_items(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
    ) -> Result<Vec<ItemView>> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::ReadItem(&wishlist)).into_result()?;

        let mut views = Vec::with_capacity(wishlist.item_ids.len());
        for item_id in &wishlist.item_ids {
            let Some(item) = self.docs.load::<Item>(&keys::item(*item_id)).await? else {
                tracing::warn!(item_id = %item_id, "Item index points at missing item");
                continue;
            };
            views.push(self.view(identity, &wishlist, item.value).await?);
        }
        Ok(views)
    }

    /// A single item.
    ///
    /// # Errors
    ///
    /// `NotFound` if the wishlist or item is missing, or the read denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id, item_id = %item_id))]
    pub async fn get_item(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
        item_id: ItemId,
    ) -> Result<ItemView> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::ReadItem(&wishlist)).into_result()?;
        let item = self.load_item(&wishlist, item_id).await?.value;
        self.view(identity, &wishlist, item).await
    }

    /// Add an item to a wishlist.
    ///
    /// # Errors
    ///
    /// `NotFound`, the manage denial, `Validation`, or `LimitExceeded` when
    /// the wishlist is full.
    #[instrument(skip(self, identity, input), fields(wishlist_id = %wishlist_id))]
    pub async fn add_item(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
        input: NewItem,
    ) -> Result<ItemView> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::CreateItem(&wishlist)).into_result()?;

        let max = self.limits.max_items_per_wishlist;
        if wishlist.item_ids.len() >= max {
            return Err(item_ceiling(max));
        }
        let now = self.clock.now();
        let item = Item::create(wishlist_id, input, now)?;

        // The item is unreachable until the index append below succeeds.
        let item_key = keys::item(item.id);
        self.docs.save(&item_key, Precondition::Absent, &item).await?;

        let item_id = item.id;
        let appended = self
            .modify(&keys::wishlist(wishlist_id), |current: Option<Wishlist>| {
                let mut current = current.ok_or(ServiceError::NotFound(Resource::Wishlist))?;
                if current.item_ids.len() >= max {
                    return Err(item_ceiling(max));
                }
                current.item_ids.push(item_id);
                current.updated_at = now;
                Ok(current)
            })
            .await;

        let wishlist = match appended {
            Ok(w) => w,
            Err(e) => {
                if let Err(cleanup) = self.docs.delete(&item_key).await {
                    tracing::warn!(item_id = %item_id, error = %cleanup, "Failed to remove unindexed item");
                }
                return Err(e);
            }
        };

        tracing::info!(item_id = %item_id, "Item added");
        self.view(identity, &wishlist, item).await
    }

    /// Apply a partial update to an item.
    ///
    /// # Errors
    ///
    /// `NotFound`, the manage denial, `Validation`, or `Conflict`.
    #[instrument(skip(self, identity, patch), fields(wishlist_id = %wishlist_id, item_id = %item_id))]
    pub async fn update_item(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
        item_id: ItemId,
        patch: ItemPatch,
    ) -> Result<ItemView> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::UpdateItem(&wishlist)).into_result()?;
        let read = self.load_item(&wishlist, item_id).await?;

        let mut item = read.value;
        item.apply(patch, self.clock.now())?;
        self.docs
            .save(&keys::item(item_id), Precondition::Matches(read.version), &item)
            .await?;

        tracing::info!("Item updated");
        self.view(identity, &wishlist, item).await
    }

    /// Remove an item from its wishlist.
    ///
    /// # Errors
    ///
    /// `NotFound` or the manage denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id, item_id = %item_id))]
    pub async fn delete_item(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
        item_id: ItemId,
    ) -> Result<()> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(identity, Request::DeleteItem(&wishlist)).into_result()?;
        if !wishlist.contains_item(item_id) {
            return Err(ServiceError::NotFound(Resource::Item));
        }

        let now = self.clock.now();
        self.modify(&keys::wishlist(wishlist_id), |current: Option<Wishlist>| {
            let mut current = current.ok_or(ServiceError::NotFound(Resource::Wishlist))?;
            current.item_ids.retain(|id| *id != item_id);
            current.updated_at = now;
            Ok(current)
        })
        .await?;

        if let Err(e) = self.docs.delete(&keys::item(item_id)).await {
            tracing::warn!(error = %e, "Failed to delete unindexed item");
        }
        tracing::info!("Item deleted");
        Ok(())
    }

    // =========================================================================
    // Purchases
    // =========================================================================

    /// Claim an item for the caller.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired`, the claim denial, `RateLimitExceeded`,
    /// `AlreadyClaimed`, or `Conflict` when a concurrent claim won.
    #[instrument(skip(self, identity), fields(item_id = %item_id))]
    pub async fn claim_purchase(
        &self,
        identity: &Identity,
        item_id: ItemId,
    ) -> Result<Metered<Claim>> {
        let (wishlist, item) = self.load_item_with_wishlist(item_id).await?;
        policy::evaluate(identity, Request::ClaimPurchase(&wishlist)).into_result()?;
        let claimant = caller(identity)?;

        let quota = self
            .spend_quota(claimant, QuotaClass::PurchaseClaim)
            .await?;

        let claim = self
            .claims
            .claim(item.id, wishlist.id, claimant, self.clock.now())
            .await
            .map_err(claim_error)?;

        Ok(Metered {
            value: claim,
            quota,
        })
    }

    /// Release the active claim on an item.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired`, the release denial (always for the owner),
    /// `NotFound` when nothing is claimed, or `Conflict`.
    #[instrument(skip(self, identity), fields(item_id = %item_id))]
    pub async fn release_purchase(&self, identity: &Identity, item_id: ItemId) -> Result<Purchase> {
        let (wishlist, item) = self.load_item_with_wishlist(item_id).await?;
        policy::evaluate(
            identity,
            Request::ReleasePurchase {
                wishlist: &wishlist,
                purchase: None,
            },
        )
        .into_result()?;

        self.claims
            .release(identity, &wishlist, item.id, self.clock.now())
            .await
            .map_err(claim_error)
    }

    /// Purchases on a wishlist visible to the caller: all of them for an
    /// admin moderating someone else's wishlist, otherwise only the caller's
    /// own. The owner is always refused.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AuthenticationRequired`, or the read denial.
    #[instrument(skip(self, identity), fields(wishlist_id = %wishlist_id))]
    pub async fn list_purchases(
        &self,
        identity: &Identity,
        wishlist_id: WishlistId,
    ) -> Result<Vec<Purchase>> {
        let wishlist = self.load_wishlist(wishlist_id).await?.value;
        policy::evaluate(
            identity,
            Request::ReadPurchase {
                wishlist: &wishlist,
                purchase: None,
            },
        )
        .into_result()?;

        let mut visible = Vec::new();
        for item_id in &wishlist.item_ids {
            let Some(ledger) = self.claims.claims_for(*item_id).await? else {
                continue;
            };
            visible.extend(ledger.purchases.into_iter().filter(|p| {
                policy::evaluate(
                    identity,
                    Request::ReadPurchase {
                        wishlist: &wishlist,
                        purchase: Some(p),
                    },
                )
                .is_allowed()
            }));
        }
        Ok(visible)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load_wishlist(&self, id: WishlistId) -> Result<Versioned<Wishlist>> {
        self.docs
            .load::<Wishlist>(&keys::wishlist(id))
            .await?
            .ok_or(ServiceError::NotFound(Resource::Wishlist))
    }

    /// Load an item that is indexed by `wishlist`.
    async fn load_item(&self, wishlist: &Wishlist, item_id: ItemId) -> Result<Versioned<Item>> {
        if !wishlist.contains_item(item_id) {
            return Err(ServiceError::NotFound(Resource::Item));
        }
        self.docs
            .load::<Item>(&keys::item(item_id))
            .await?
            .filter(|item| item.value.wishlist_id == wishlist.id)
            .ok_or(ServiceError::NotFound(Resource::Item))
    }

    async fn load_item_with_wishlist(&self, item_id: ItemId) -> Result<(Wishlist, Item)> {
        let item = self
            .docs
            .load::<Item>(&keys::item(item_id))
            .await?
            .ok_or(ServiceError::NotFound(Resource::Item))?
            .value;
        let wishlist = self
            .docs
            .load::<Wishlist>(&keys::wishlist(item.wishlist_id))
            .await?
            .ok_or(ServiceError::NotFound(Resource::Item))?
            .value;
        if !wishlist.contains_item(item_id) {
            return Err(ServiceError::NotFound(Resource::Item));
        }
        Ok((wishlist, item))
    }

    /// Shape an item for `identity`. The owner gets no claim summary.
    async fn view(&self, identity: &Identity, wishlist: &Wishlist, item: Item) -> Result<ItemView> {
        let is_owner = identity.user_id().is_some_and(|u| wishlist.is_owned_by(u));
        if is_owner {
            return Ok(ItemView { item, claim: None });
        }
        let ledger = self.claims.claims_for(item.id).await?;
        Ok(ItemView {
            claim: Some(claim_view(identity, ledger.as_ref())),
            item,
        })
    }

    async fn spend_quota(&self, subject: &UserId, class: QuotaClass) -> Result<QuotaStatus> {
        match self
            .quota
            .check_and_increment(subject.as_str(), class, self.clock.now())
            .await?
        {
            QuotaDecision::Accepted(status) => Ok(status),
            QuotaDecision::Rejected(status) => {
                Err(ServiceError::RateLimitExceeded(QuotaRejection { class, status }))
            }
        }
    }

    /// Read-modify-write a document with compare-and-set, re-reading on a
    /// lost race. `change` sees `None` when the document does not exist.
    async fn modify<T, F>(&self, key: &str, mut change: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnMut(Option<T>) -> Result<T> + Send,
    {
        for _ in 0..INDEX_ATTEMPTS {
            let read = self.docs.load::<T>(key).await?;
            let precondition = Precondition::observed(read.as_ref());
            let next = change(read.map(|r| r.value))?;
            match self.docs.save(key, precondition, &next).await {
                Ok(_) => return Ok(next),
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(key, "Index changed underneath us, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict)
    }

    /// Best-effort removal of a wishlist id from its owner's index.
    async fn unlist_wishlist(&self, owner: &UserId, wishlist_id: WishlistId) {
        let result = self
            .modify(&keys::owner(owner), |index: Option<OwnerIndex>| {
                let mut index = index.ok_or(ServiceError::NotFound(Resource::Wishlist))?;
                index.wishlist_ids.retain(|id| *id != wishlist_id);
                Ok(index)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(wishlist_id = %wishlist_id, error = %e, "Failed to update owner index");
        }
    }
}

fn caller(identity: &Identity) -> Result<&UserId> {
    identity
        .user_id()
        .ok_or(ServiceError::AuthenticationRequired)
}

fn item_ceiling(max: usize) -> ServiceError {
    ServiceError::LimitExceeded(format!("a wishlist may hold at most {max} items"))
}

fn claim_view(identity: &Identity, ledger: Option<&ClaimLedger>) -> ClaimView {
    let active = ledger.and_then(ClaimLedger::active);
    ClaimView {
        claimed: active.is_some(),
        claimed_by_you: active.is_some_and(|p| identity.is(&p.purchased_by)),
    }
}

fn claim_error(err: ClaimError) -> ServiceError {
    match err {
        ClaimError::AlreadyClaimed => ServiceError::AlreadyClaimed,
        ClaimError::Conflict => ServiceError::Conflict,
        ClaimError::NotFound => ServiceError::NotFound(Resource::Purchase),
        ClaimError::Denied(denial) => denial.into(),
        ClaimError::Store(e) => e.into(),
    }
}
