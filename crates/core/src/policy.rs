//! Access policy for wishlists, items, and purchases.
//!
//! [`evaluate`] is a pure function from `(identity, request)` to a
//! [`Decision`]. It performs no I/O; callers load the resource state first
//! and pass it in by reference.
//!
//! # Rules
//!
//! | Resource | Read | Write |
//! |---|---|---|
//! | Wishlist | public, owner, or admin | create: any authenticated caller; update/delete: owner or admin |
//! | Item | same as the parent wishlist | owner or admin |
//! | Purchase | never the owner; otherwise the claimant or admin | claim: any non-owner who can read the wishlist; release: claimant or admin |
//!
//! # Owner blindness
//!
//! A wishlist owner may never learn who claimed their items, or whether a
//! claim exists. Purchase requests from the owner are denied with
//! [`Denial::OwnerBlind`] before anything else is looked at, including the
//! admin grant: an admin moderating someone else's wishlist can see its
//! purchases, an admin viewing their own cannot.

use crate::types::{Identity, Purchase, Wishlist};

/// An action on a concrete resource, carrying the state the rules need.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    CreateWishlist,
    ReadWishlist(&'a Wishlist),
    UpdateWishlist(&'a Wishlist),
    DeleteWishlist(&'a Wishlist),
    ReadItem(&'a Wishlist),
    CreateItem(&'a Wishlist),
    UpdateItem(&'a Wishlist),
    DeleteItem(&'a Wishlist),
    /// Read purchase records on `wishlist`. With `purchase: None` this is
    /// the gate evaluated before any record is loaded.
    ReadPurchase {
        wishlist: &'a Wishlist,
        purchase: Option<&'a Purchase>,
    },
    ClaimPurchase(&'a Wishlist),
    /// Release a claim. With `purchase: None` this is the gate evaluated
    /// before the claim ledger is loaded.
    ReleasePurchase {
        wishlist: &'a Wishlist,
        purchase: Option<&'a Purchase>,
    },
}

/// Why an authenticated caller was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForbiddenReason {
    /// The wishlist is private and the caller is neither owner nor admin.
    PrivateWishlist,
    /// Only the owner or an admin may change the resource.
    NotOwner,
    /// Only the claimant or an admin may see or release this purchase.
    NotClaimant,
    /// Owners cannot claim items on their own wishlists.
    OwnerCannotClaim,
}

/// Reason a request was denied.
///
/// `Forbidden` covers role and ownership mismatches; `OwnerBlind` is the
/// structural secrecy rule. Both render as the same external message so the
/// distinction is only visible to code, never on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Denial {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("permission denied")]
    Forbidden(ForbiddenReason),
    #[error("permission denied")]
    OwnerBlind,
}

/// Outcome of a policy evaluation.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert into a `Result` for `?` propagation.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] if the request was not allowed.
    pub const fn into_result(self) -> Result<(), Denial> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(denial) => Err(denial),
        }
    }
}

/// Evaluate `request` on behalf of `identity`.
pub fn evaluate(identity: &Identity, request: Request<'_>) -> Decision {
    match request {
        Request::CreateWishlist => require_authenticated(identity),
        Request::ReadWishlist(wishlist) | Request::ReadItem(wishlist) => {
            can_read(identity, wishlist)
        }
        Request::UpdateWishlist(wishlist)
        | Request::DeleteWishlist(wishlist)
        | Request::CreateItem(wishlist)
        | Request::UpdateItem(wishlist)
        | Request::DeleteItem(wishlist) => can_manage(identity, wishlist),
        Request::ReadPurchase { wishlist, purchase } => {
            purchase_gate(identity, wishlist).and(|| match purchase {
                None => can_read(identity, wishlist),
                Some(p) => claimant_or_admin(identity, p),
            })
        }
        Request::ClaimPurchase(wishlist) => require_authenticated(identity)
            .and(|| {
                if identity.user_id().is_some_and(|u| wishlist.is_owned_by(u)) {
                    Decision::Deny(Denial::Forbidden(ForbiddenReason::OwnerCannotClaim))
                } else {
                    Decision::Allow
                }
            })
            .and(|| can_read(identity, wishlist)),
        Request::ReleasePurchase { wishlist, purchase } => {
            purchase_gate(identity, wishlist).and(|| match purchase {
                None => Decision::Allow,
                Some(p) => claimant_or_admin(identity, p),
            })
        }
    }
}

impl Decision {
    fn and(self, next: impl FnOnce() -> Self) -> Self {
        match self {
            Self::Allow => next(),
            deny @ Self::Deny(_) => deny,
        }
    }
}

fn require_authenticated(identity: &Identity) -> Decision {
    if identity.is_authenticated() {
        Decision::Allow
    } else {
        Decision::Deny(Denial::AuthenticationRequired)
    }
}

fn can_read(identity: &Identity, wishlist: &Wishlist) -> Decision {
    if wishlist.is_public {
        return Decision::Allow;
    }
    require_authenticated(identity).and(|| {
        if is_owner(identity, wishlist) || identity.is_admin() {
            Decision::Allow
        } else {
            Decision::Deny(Denial::Forbidden(ForbiddenReason::PrivateWishlist))
        }
    })
}

fn can_manage(identity: &Identity, wishlist: &Wishlist) -> Decision {
    require_authenticated(identity).and(|| {
        if is_owner(identity, wishlist) || identity.is_admin() {
            Decision::Allow
        } else {
            Decision::Deny(Denial::Forbidden(ForbiddenReason::NotOwner))
        }
    })
}

/// Authentication plus owner blindness; shared by every purchase request.
fn purchase_gate(identity: &Identity, wishlist: &Wishlist) -> Decision {
    require_authenticated(identity).and(|| {
        if is_owner(identity, wishlist) {
            Decision::Deny(Denial::OwnerBlind)
        } else {
            Decision::Allow
        }
    })
}

fn claimant_or_admin(identity: &Identity, purchase: &Purchase) -> Decision {
    if identity.is(&purchase.purchased_by) || identity.is_admin() {
        Decision::Allow
    } else {
        Decision::Deny(Denial::Forbidden(ForbiddenReason::NotClaimant))
    }
}

fn is_owner(identity: &Identity, wishlist: &Wishlist) -> bool {
    identity.user_id().is_some_and(|u| wishlist.is_owned_by(u))
}
