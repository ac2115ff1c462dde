//! Wishlists, items, and purchase records.
//!
//! ## Constraints
//!
//! | Field | Rule |
//! |---|---|
//! | `Wishlist.name` | 1-100 characters after trimming |
//! | `Item.name` | 1-200 characters after trimming |
//! | `Item.description` | at most 500 characters |
//! | `Item.note` | at most 1000 characters |
//! | `Item.priority` | 1-5 |
//! | `Item.url` | absolute `http`/`https`, at most 2048 characters |
//! | `Item.price` | non-negative, at most 2 decimal places |
//!
//! Lengths count Unicode scalar values, not bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{ItemId, Price, PriceError, PurchaseId, PurchaseStatus, UserId, WishlistId};

/// Field constraint violations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field is empty or only whitespace.
    #[error("{field} cannot be empty")]
    Empty {
        /// Offending field.
        field: &'static str,
    },
    /// A text field exceeds its maximum length.
    #[error("{field} must be at most {max} characters")]
    TooLong {
        /// Offending field.
        field: &'static str,
        /// Maximum allowed length.
        max: usize,
    },
    /// A numeric field is outside its allowed range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
    /// The item URL is not an absolute http(s) URL.
    #[error("url must be an absolute http or https URL")]
    InvalidUrl,
    /// The item price is invalid.
    #[error("price: {0}")]
    Price(#[from] PriceError),
}

pub const WISHLIST_NAME_MAX: usize = 100;
pub const ITEM_NAME_MAX: usize = 200;
pub const ITEM_DESCRIPTION_MAX: usize = 500;
pub const ITEM_NOTE_MAX: usize = 1000;
pub const ITEM_URL_MAX: usize = 2048;
pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 5;

// =============================================================================
// Wishlist
// =============================================================================

/// A wishlist and the ordered index of the items it owns.
///
/// The item index lives on the wishlist document so that listing items and
/// enforcing the per-wishlist item ceiling are single-document operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wishlist {
    pub id: WishlistId,
    pub owner_id: UserId,
    pub name: String,
    pub is_public: bool,
    #[serde(default)]
    pub item_ids: Vec<ItemId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wishlist {
    /// Create a new, empty wishlist owned by `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the draft's name is invalid.
    pub fn create(
        owner_id: UserId,
        draft: NewWishlist,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let name = validate_required("name", &draft.name, WISHLIST_NAME_MAX)?;
        Ok(Self {
            id: WishlistId::generate(),
            owner_id,
            name,
            is_public: draft.is_public,
            item_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `user` owns this wishlist.
    #[must_use]
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.owner_id == user
    }

    /// Whether the item index contains `item_id`.
    #[must_use]
    pub fn contains_item(&self, item_id: ItemId) -> bool {
        self.item_ids.contains(&item_id)
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the new name is invalid; the
    /// wishlist is left untouched in that case.
    pub fn apply(&mut self, patch: WishlistPatch, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let name = patch
            .name
            .map(|n| validate_required("name", &n, WISHLIST_NAME_MAX))
            .transpose()?;
        if let Some(name) = name {
            self.name = name;
        }
        if let Some(is_public) = patch.is_public {
            self.is_public = is_public;
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Fields accepted when creating a wishlist.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewWishlist {
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Partial update of a wishlist.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WishlistPatch {
    pub name: Option<String>,
    pub is_public: Option<bool>,
}

// =============================================================================
// Item
// =============================================================================

/// A gift idea on a wishlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub wishlist_id: WishlistId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Validate a draft and build a new item on `wishlist_id`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found in the draft.
    pub fn create(
        wishlist_id: WishlistId,
        draft: NewItem,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let item = Self {
            id: ItemId::generate(),
            wishlist_id,
            name: validate_required("name", &draft.name, ITEM_NAME_MAX)?,
            description: validate_optional("description", draft.description, ITEM_DESCRIPTION_MAX)?,
            price: draft.price,
            url: validate_url(draft.url)?,
            priority: draft.priority,
            note: validate_optional("note", draft.note, ITEM_NOTE_MAX)?,
            created_at: now,
            updated_at: now,
        };
        item.validate()?;
        Ok(item)
    }

    /// Apply a partial update, validating the result as a whole.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if any updated field is invalid; the
    /// item is left untouched in that case.
    pub fn apply(&mut self, patch: ItemPatch, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut next = self.clone();
        if let Some(name) = patch.name {
            next.name = validate_required("name", &name, ITEM_NAME_MAX)?;
        }
        if let Some(description) = patch.description {
            next.description = validate_optional("description", description, ITEM_DESCRIPTION_MAX)?;
        }
        if let Some(price) = patch.price {
            next.price = price;
        }
        if let Some(url) = patch.url {
            next.url = validate_url(url)?;
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(note) = patch.note {
            next.note = validate_optional("note", note, ITEM_NOTE_MAX)?;
        }
        next.validate()?;
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(ValidationError::OutOfRange {
                field: "priority",
                min: i64::from(PRIORITY_MIN),
                max: i64::from(PRIORITY_MAX),
            });
        }
        if let Some(price) = &self.price {
            price.validate()?;
        }
        Ok(())
    }
}

/// Fields accepted when adding an item.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub url: Option<String>,
    pub priority: u8,
    #[serde(default)]
    pub note: Option<String>,
}

impl NewItem {
    /// A draft with just a name and priority.
    #[must_use]
    pub fn named(name: impl Into<String>, priority: u8) -> Self {
        Self {
            name: name.into(),
            description: None,
            price: None,
            url: None,
            priority,
            note: None,
        }
    }
}

/// Partial update of an item.
///
/// Absent fields are left unchanged. For optional fields, an explicit
/// `null` clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ItemPatch {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub price: Option<Option<Price>>,
    #[serde(default, deserialize_with = "nullable")]
    pub url: Option<Option<String>>,
    pub priority: Option<u8>,
    #[serde(default, deserialize_with = "nullable")]
    pub note: Option<Option<String>>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// =============================================================================
// Purchase
// =============================================================================

/// A claim by a non-owner that they will buy an item.
///
/// Never shown to the owner of the wishlist the item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: PurchaseId,
    pub item_id: ItemId,
    pub purchased_by: UserId,
    pub claimed_at: DateTime<Utc>,
    pub status: PurchaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl Purchase {
    /// Open a new active claim.
    #[must_use]
    pub fn claim(item_id: ItemId, purchased_by: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: PurchaseId::generate(),
            item_id,
            purchased_by,
            claimed_at: now,
            status: PurchaseStatus::Active,
            released_at: None,
        }
    }

    /// Whether this record is the item's current claim.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Mark the claim released. Idempotent.
    pub fn release(&mut self, now: DateTime<Utc>) {
        if self.is_active() {
            self.status = PurchaseStatus::Released;
            self.released_at = Some(now);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_required(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if trimmed.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(trimmed.to_owned())
}

fn validate_optional(
    field: &'static str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::TooLong { field, max }),
        Some(v) if v.trim().is_empty() => Ok(None),
        other => Ok(other),
    }
}

fn validate_url(value: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.chars().count() > ITEM_URL_MAX {
        return Err(ValidationError::TooLong {
            field: "url",
            max: ITEM_URL_MAX,
        });
    }
    let parsed = url::Url::parse(raw).map_err(|_| ValidationError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ValidationError::InvalidUrl);
    }
    Ok(Some(raw.to_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::CurrencyCode;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_item_rejects_priority_out_of_range() {
        let err = Item::create(WishlistId::generate(), NewItem::named("Kettle", 6), now()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "priority",
                min: 1,
                max: 5
            }
        );
        assert!(Item::create(WishlistId::generate(), NewItem::named("Kettle", 0), now()).is_err());
    }

    #[test]
    fn test_item_rejects_empty_name() {
        let err = Item::create(WishlistId::generate(), NewItem::named("", 3), now()).unwrap_err();
        assert_eq!(err, ValidationError::Empty { field: "name" });
        let err = Item::create(WishlistId::generate(), NewItem::named("   ", 3), now()).unwrap_err();
        assert_eq!(err, ValidationError::Empty { field: "name" });
    }

    #[test]
    fn test_item_length_limits() {
        let mut draft = NewItem::named("x".repeat(200), 1);
        assert!(Item::create(WishlistId::generate(), draft.clone(), now()).is_ok());

        draft.name = "x".repeat(201);
        assert!(matches!(
            Item::create(WishlistId::generate(), draft.clone(), now()),
            Err(ValidationError::TooLong { field: "name", max: 200 })
        ));

        draft.name = "Book".to_string();
        draft.description = Some("d".repeat(501));
        assert!(matches!(
            Item::create(WishlistId::generate(), draft.clone(), now()),
            Err(ValidationError::TooLong { field: "description", .. })
        ));

        draft.description = None;
        draft.note = Some("n".repeat(1001));
        assert!(matches!(
            Item::create(WishlistId::generate(), draft, now()),
            Err(ValidationError::TooLong { field: "note", .. })
        ));
    }

    #[test]
    fn test_item_lengths_count_characters_not_bytes() {
        let name = "é".repeat(200);
        assert!(Item::create(WishlistId::generate(), NewItem::named(name, 2), now()).is_ok());
    }

    #[test]
    fn test_item_url_validation() {
        let mut draft = NewItem::named("Lamp", 2);
        draft.url = Some("https://shop.example.com/lamp".to_string());
        assert!(Item::create(WishlistId::generate(), draft.clone(), now()).is_ok());

        draft.url = Some("javascript:alert(1)".to_string());
        assert_eq!(
            Item::create(WishlistId::generate(), draft.clone(), now()).unwrap_err(),
            ValidationError::InvalidUrl
        );

        draft.url = Some("not a url".to_string());
        assert!(Item::create(WishlistId::generate(), draft, now()).is_err());
    }

    #[test]
    fn test_item_price_validation() {
        let mut draft = NewItem::named("Scarf", 4);
        draft.price = Some(Price {
            amount: Decimal::new(-5, 0),
            currency_code: CurrencyCode::EUR,
        });
        assert_eq!(
            Item::create(WishlistId::generate(), draft, now()).unwrap_err(),
            ValidationError::Price(PriceError::Negative)
        );
    }

    #[test]
    fn test_item_patch_is_all_or_nothing() {
        let mut item = Item::create(WishlistId::generate(), NewItem::named("Mug", 3), now()).unwrap();
        let before = item.clone();
        let patch = ItemPatch {
            name: Some("Big mug".to_string()),
            priority: Some(9),
            ..ItemPatch::default()
        };
        assert!(item.apply(patch, now()).is_err());
        assert_eq!(item, before);
    }

    #[test]
    fn test_item_patch_null_clears_optional_field() {
        let mut draft = NewItem::named("Pen", 3);
        draft.note = Some("blue ink".to_string());
        let mut item = Item::create(WishlistId::generate(), draft, now()).unwrap();

        let patch: ItemPatch = serde_json::from_str(r#"{"note": null, "priority": 5}"#).unwrap();
        item.apply(patch, now()).unwrap();
        assert_eq!(item.note, None);
        assert_eq!(item.priority, 5);

        let patch: ItemPatch = serde_json::from_str(r#"{"name": "Fountain pen"}"#).unwrap();
        item.apply(patch, now()).unwrap();
        assert_eq!(item.name, "Fountain pen");
        assert_eq!(item.priority, 5);
    }

    #[test]
    fn test_drafts_reject_unknown_fields() {
        let injected = r#"{"name": "Pen", "priority": 3, "ownerId": "mallory"}"#;
        assert!(serde_json::from_str::<NewItem>(injected).is_err());

        let injected = r#"{"name": "Mine", "ownerId": "mallory"}"#;
        assert!(serde_json::from_str::<NewWishlist>(injected).is_err());
    }

    #[test]
    fn test_wishlist_patch_updates_visibility() {
        let owner = UserId::parse("alice").unwrap();
        let mut wishlist = Wishlist::create(
            owner.clone(),
            NewWishlist {
                name: "Birthday".to_string(),
                is_public: false,
            },
            now(),
        )
        .unwrap();
        assert!(wishlist.is_owned_by(&owner));

        wishlist
            .apply(
                WishlistPatch {
                    name: None,
                    is_public: Some(true),
                },
                now(),
            )
            .unwrap();
        assert!(wishlist.is_public);
        assert_eq!(wishlist.name, "Birthday");
    }

    #[test]
    fn test_purchase_release_is_idempotent() {
        let mut purchase = Purchase::claim(ItemId::generate(), UserId::parse("v").unwrap(), now());
        assert!(purchase.is_active());
        purchase.release(now());
        let released_at = purchase.released_at;
        purchase.release(DateTime::from_timestamp(1_800_000_000, 0).unwrap());
        assert_eq!(purchase.status, PurchaseStatus::Released);
        assert_eq!(purchase.released_at, released_at);
    }
}
