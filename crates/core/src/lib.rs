//! Wishlist Core - domain types and access policy.
//!
//! This crate provides the types shared by every wishlist component:
//! - `server` - JSON API, claim coordination, and quota enforcement
//! - `cli` - Command-line tools for migrations and audits
//!
//! # Architecture
//!
//! The core crate contains only types, validation, and the pure policy
//! evaluator - no I/O, no storage access, no HTTP. Every authorization
//! decision can therefore be tested without a runtime.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, identities, wishlists, items, purchases
//! - [`policy`] - Who may read or write which resource

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod policy;
pub mod types;

pub use policy::{Decision, Denial, ForbiddenReason, Request};
pub use types::*;
