//! Error taxonomy for wishlist service operations.
//!
//! Messages never include user ids. Permission denials keep their
//! [`Denial`] so code and tests can tell an ownership mismatch from an
//! owner-blindness refusal; the HTTP layer renders both identically.

use std::time::Duration;

use thiserror::Error;
use wishlist_core::{Denial, ValidationError};

use super::quota::{QuotaClass, QuotaError, QuotaStatus};
use crate::db::StoreError;

/// Which resource a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Wishlist,
    Item,
    Purchase,
}

impl Resource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wishlist => "wishlist",
            Self::Item => "item",
            Self::Purchase => "purchase",
        }
    }
}

/// A quota rejection, carried to the transport layer for the
/// `limit`/`remaining`/`resetAt` response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRejection {
    pub class: QuotaClass,
    pub status: QuotaStatus,
}

/// Errors returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("permission denied")]
    PermissionDenied(Denial),

    #[error("{} not found", .0.as_str())]
    NotFound(Resource),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("item is already claimed")]
    AlreadyClaimed,

    /// Lost a compare-and-set race. Never retried by the engine.
    #[error("concurrent modification, please retry")]
    Conflict,

    #[error("{0}")]
    LimitExceeded(String),

    #[error("rate limit exceeded for {}", .0.class)]
    RateLimitExceeded(QuotaRejection),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    /// Whether the same call may succeed if repeated unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<Denial> for ServiceError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::AuthenticationRequired => Self::AuthenticationRequired,
            other => Self::PermissionDenied(other),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => Self::Conflict,
            StoreError::Timeout(limit) => Self::Timeout(limit),
            StoreError::Database(e) => Self::Unavailable(e.to_string()),
            StoreError::DataCorruption(msg) | StoreError::Unavailable(msg) => {
                Self::Unavailable(msg)
            }
        }
    }
}

impl From<QuotaError> for ServiceError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Store(e) => e.into(),
            QuotaError::Contended(_) | QuotaError::NotConfigured(..) => {
                Self::Unavailable(err.to_string())
            }
        }
    }
}

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
