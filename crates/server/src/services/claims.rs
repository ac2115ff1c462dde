//! Purchase claim coordination.
//!
//! Each item has one [`ClaimLedger`] document holding every purchase ever
//! recorded for it. At most one of them is active. All transitions are a
//! single compare-and-set against the version read at the start of the
//! operation:
//!
//! ```text
//! Unclaimed --claim(u)--> Claimed(u)
//! Claimed(u) --claim(u)--> Claimed(u)          (returns existing purchase)
//! Claimed(u) --claim(v)--> AlreadyClaimed
//! Claimed(u) --release(u | admin)--> Unclaimed (purchase kept as released)
//! ```
//!
//! Losing the compare-and-set is reported as [`ClaimError::Conflict`] and
//! never retried here: the caller must re-read to learn who won.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wishlist_core::policy::{self, Request};
use wishlist_core::{Denial, Identity, ItemId, Purchase, PurchaseId, UserId, Wishlist, WishlistId};

use crate::db::{Documents, Precondition, StoreError, keys};

/// Every purchase recorded for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimLedger {
    pub item_id: ItemId,
    pub wishlist_id: WishlistId,
    #[serde(default)]
    pub purchases: Vec<Purchase>,
}

impl ClaimLedger {
    #[must_use]
    pub const fn new(item_id: ItemId, wishlist_id: WishlistId) -> Self {
        Self {
            item_id,
            wishlist_id,
            purchases: Vec::new(),
        }
    }

    /// The active purchase, if the item is claimed.
    #[must_use]
    pub fn active(&self) -> Option<&Purchase> {
        self.purchases.iter().find(|p| p.is_active())
    }

    fn active_mut(&mut self) -> Option<&mut Purchase> {
        self.purchases.iter_mut().find(|p| p.is_active())
    }

    /// Check the ledger's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify(&self) -> Result<(), LedgerViolation> {
        if let Some(foreign) = self.purchases.iter().find(|p| p.item_id != self.item_id) {
            return Err(LedgerViolation::ForeignPurchase {
                item_id: self.item_id,
                purchase_id: foreign.id,
            });
        }
        let active = self.purchases.iter().filter(|p| p.is_active()).count();
        if active > 1 {
            return Err(LedgerViolation::MultipleActive {
                item_id: self.item_id,
                count: active,
            });
        }
        Ok(())
    }
}

/// A broken claim ledger, found by [`ClaimLedger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerViolation {
    #[error("item {item_id} has {count} active purchases")]
    MultipleActive { item_id: ItemId, count: usize },

    #[error("ledger for item {item_id} holds purchase {purchase_id} of another item")]
    ForeignPurchase {
        item_id: ItemId,
        purchase_id: PurchaseId,
    },

    #[error("ledger at {key} does not decode: {reason}")]
    Unreadable { key: String, reason: String },
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A new purchase was recorded.
    New(Purchase),
    /// The caller already held the active claim.
    Existing(Purchase),
}

impl Claim {
    #[must_use]
    pub const fn purchase(&self) -> &Purchase {
        match self {
            Self::New(p) | Self::Existing(p) => p,
        }
    }

    #[must_use]
    pub fn into_purchase(self) -> Purchase {
        match self {
            Self::New(p) | Self::Existing(p) => p,
        }
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Errors from the claim coordinator.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("item is already claimed")]
    AlreadyClaimed,

    #[error("lost a concurrent claim update")]
    Conflict,

    #[error("no active claim on item")]
    NotFound,

    #[error("permission denied")]
    Denied(Denial),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => Self::Conflict,
            other => Self::Store(other),
        }
    }
}

/// Applies claim and release transitions to claim ledgers.
#[derive(Clone)]
pub struct ClaimCoordinator {
    docs: Documents,
}

impl ClaimCoordinator {
    #[must_use]
    pub const fn new(docs: Documents) -> Self {
        Self { docs }
    }

    /// Claim `item_id` for `claimant`.
    ///
    /// Authorization is the caller's job; this only enforces the
    /// single-active-claim invariant.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyClaimed` if someone else holds the claim, `Conflict`
    /// if a concurrent writer changed the ledger first, or a store error.
    pub async fn claim(
        &self,
        item_id: ItemId,
        wishlist_id: WishlistId,
        claimant: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Claim, ClaimError> {
        let key = keys::claims(item_id);
        let read = self.docs.load::<ClaimLedger>(&key).await?;
        let precondition = Precondition::observed(read.as_ref());
        let mut ledger = read.map_or_else(|| ClaimLedger::new(item_id, wishlist_id), |r| r.value);

        if let Some(active) = ledger.active() {
            if &active.purchased_by == claimant {
                return Ok(Claim::Existing(active.clone()));
            }
            return Err(ClaimError::AlreadyClaimed);
        }

        let purchase = Purchase::claim(item_id, claimant.clone(), now);
        ledger.purchases.push(purchase.clone());
        self.docs.save(&key, precondition, &ledger).await?;

        tracing::info!(item_id = %item_id, purchase_id = %purchase.id, "Item claimed");
        Ok(Claim::New(purchase))
    }

    /// Release the active claim on `item_id` on behalf of `identity`.
    ///
    /// The release rule is evaluated against the stored purchase, so only
    /// its claimant or an admin who does not own `wishlist` succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is claimed, `Denied` if the caller may
    /// not release this purchase, `Conflict` on a lost race, or a store
    /// error.
    pub async fn release(
        &self,
        identity: &Identity,
        wishlist: &Wishlist,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<Purchase, ClaimError> {
        let key = keys::claims(item_id);
        let Some(read) = self.docs.load::<ClaimLedger>(&key).await? else {
            return Err(ClaimError::NotFound);
        };
        let precondition = Precondition::observed(Some(&read));
        let mut ledger = read.value;

        let active = ledger.active().ok_or(ClaimError::NotFound)?;
        policy::evaluate(
            identity,
            Request::ReleasePurchase {
                wishlist,
                purchase: Some(active),
            },
        )
        .into_result()
        .map_err(ClaimError::Denied)?;

        let released = {
            let active = ledger.active_mut().ok_or(ClaimError::NotFound)?;
            active.release(now);
            active.clone()
        };
        self.docs.save(&key, precondition, &ledger).await?;

        tracing::info!(item_id = %item_id, purchase_id = %released.id, "Claim released");
        Ok(released)
    }

    /// The claim ledger for `item_id`, if any purchase was ever recorded.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub async fn claims_for(&self, item_id: ItemId) -> Result<Option<ClaimLedger>, StoreError> {
        Ok(self
            .docs
            .load::<ClaimLedger>(&keys::claims(item_id))
            .await?
            .map(|r| r.value))
    }

    /// Scan every claim ledger and report violations.
    ///
    /// # Errors
    ///
    /// Returns a store error if listing or reading fails. Undecodable
    /// ledgers are reported as violations rather than errors.
    pub async fn audit(&self) -> Result<Vec<LedgerViolation>, StoreError> {
        let mut violations = Vec::new();
        for key in self.docs.list(keys::CLAIMS_PREFIX).await? {
            match self.docs.load::<ClaimLedger>(&key).await {
                Ok(Some(read)) => {
                    if let Err(v) = read.value.verify() {
                        violations.push(v);
                    }
                }
                Ok(None) => {}
                Err(StoreError::DataCorruption(reason)) => {
                    violations.push(LedgerViolation::Unreadable { key, reason });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(violations)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use wishlist_core::{ForbiddenReason, NewWishlist, PurchaseStatus, Role};

    use super::*;
    use crate::db::MemoryStore;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn setup() -> (ClaimCoordinator, Documents, Wishlist, ItemId) {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let wishlist = Wishlist::create(
            user("alice"),
            NewWishlist {
                name: "Birthday".to_string(),
                is_public: true,
            },
            now(),
        )
        .unwrap();
        (
            ClaimCoordinator::new(docs.clone()),
            docs,
            wishlist,
            ItemId::generate(),
        )
    }

    #[tokio::test]
    async fn test_claim_then_reclaim_is_idempotent() {
        let (coordinator, _, wishlist, item) = setup();
        let first = coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap();
        assert!(first.is_new());

        let second = coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(first.purchase().id, second.purchase().id);
    }

    #[tokio::test]
    async fn test_second_claimant_is_refused() {
        let (coordinator, _, wishlist, item) = setup();
        coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap();
        let err = coordinator
            .claim(item, wishlist.id, &user("carol"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::AlreadyClaimed));
    }

    #[tokio::test]
    async fn test_release_keeps_record_and_allows_new_claim() {
        let (coordinator, _, wishlist, item) = setup();
        let bob = Identity::user(user("bob"));
        let first = coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap()
            .into_purchase();

        let released = coordinator
            .release(&bob, &wishlist, item, now())
            .await
            .unwrap();
        assert_eq!(released.id, first.id);
        assert_eq!(released.status, PurchaseStatus::Released);
        assert_eq!(released.released_at, Some(now()));

        let again = coordinator
            .claim(item, wishlist.id, &user("carol"), now())
            .await
            .unwrap();
        assert!(again.is_new());
        assert_ne!(again.purchase().id, first.id);

        let ledger = coordinator.claims_for(item).await.unwrap().unwrap();
        assert_eq!(ledger.purchases.len(), 2);
        assert!(ledger.verify().is_ok());
    }

    #[tokio::test]
    async fn test_release_requires_claimant_or_admin() {
        let (coordinator, _, wishlist, item) = setup();
        coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap();

        let err = coordinator
            .release(&Identity::user(user("carol")), &wishlist, item, now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::Denied(Denial::Forbidden(ForbiddenReason::NotClaimant))
        ));

        let admin = Identity::new(user("mod"), Role::Admin);
        assert!(coordinator.release(&admin, &wishlist, item, now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_without_claim_is_not_found() {
        let (coordinator, _, wishlist, item) = setup();
        let bob = Identity::user(user("bob"));
        let err = coordinator
            .release(&bob, &wishlist, item, now())
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::NotFound));

        coordinator
            .claim(item, wishlist.id, &user("bob"), now())
            .await
            .unwrap();
        coordinator.release(&bob, &wishlist, item, now()).await.unwrap();
        let err = coordinator
            .release(&bob, &wishlist, item, now())
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_yield_exactly_one_winner() {
        let (coordinator, _, wishlist, item) = setup();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let wishlist_id = wishlist.id;
            tasks.push(tokio::spawn(async move {
                let claimant = user(&format!("guest-{i}"));
                coordinator.claim(item, wishlist_id, &claimant, now()).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(claim) => {
                    assert!(claim.is_new());
                    winners += 1;
                }
                Err(ClaimError::AlreadyClaimed | ClaimError::Conflict) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);

        let ledger = coordinator.claims_for(item).await.unwrap().unwrap();
        assert_eq!(ledger.purchases.len(), 1);
        assert!(ledger.verify().is_ok());
    }

    #[tokio::test]
    async fn test_audit_reports_multiple_active() {
        let (coordinator, docs, wishlist, item) = setup();
        let mut broken = ClaimLedger::new(item, wishlist.id);
        broken.purchases.push(Purchase::claim(item, user("bob"), now()));
        broken.purchases.push(Purchase::claim(item, user("carol"), now()));
        docs.save(&keys::claims(item), Precondition::Absent, &broken)
            .await
            .unwrap();

        let healthy = ItemId::generate();
        coordinator
            .claim(healthy, wishlist.id, &user("bob"), now())
            .await
            .unwrap();

        let violations = coordinator.audit().await.unwrap();
        assert_eq!(
            violations,
            vec![LedgerViolation::MultipleActive {
                item_id: item,
                count: 2
            }]
        );
    }

    #[test]
    fn test_verify_rejects_foreign_purchase() {
        let item = ItemId::generate();
        let mut ledger = ClaimLedger::new(item, WishlistId::generate());
        let stray = Purchase::claim(ItemId::generate(), user("bob"), now());
        let stray_id = stray.id;
        ledger.purchases.push(stray);
        assert_eq!(
            ledger.verify(),
            Err(LedgerViolation::ForeignPurchase {
                item_id: item,
                purchase_id: stray_id
            })
        );
    }
}
