//! Status and role enums shared across the engine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a purchase record.
///
/// A purchase starts `Active` and may move to `Released` exactly once.
/// Released records are kept as an audit trail and never reactivated;
/// claiming the item again creates a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    #[default]
    Active,
    Released,
}

impl PurchaseStatus {
    /// Whether this status counts towards the single-active-claim invariant.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Role carried by a verified identity claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// No credential was presented.
    #[default]
    Anonymous,
    /// A regular signed-in user.
    User,
    /// A user who also operates a store listing.
    StoreOwner,
    /// Moderator with access to every wishlist and purchase record not
    /// owned by themselves.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::User => write!(f, "user"),
            Self::StoreOwner => write!(f, "store_owner"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(Self::Anonymous),
            "user" => Ok(Self::User),
            "store_owner" | "storeOwner" => Ok(Self::StoreOwner),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("invalid role: {s}")),
        }
    }
}
