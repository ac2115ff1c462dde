//! Core types for the wishlist engine.
//!
//! This module provides type-safe wrappers and records for wishlists,
//! items, purchases, and the identities that act on them.

pub mod id;
pub mod identity;
pub mod price;
pub mod status;
pub mod wishlist;

pub use id::*;
pub use identity::Identity;
pub use price::{CurrencyCode, Price, PriceError};
pub use status::*;
pub use wishlist::{
    Item, ItemPatch, NewItem, NewWishlist, Purchase, ValidationError, Wishlist, WishlistPatch,
};
