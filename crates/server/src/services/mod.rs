//! Business logic services.
//!
//! # Services
//!
//! - `wishlists` - the service façade used by every route
//! - `claims` - purchase claim coordination (one ledger document per item)
//! - `quota` - windowed per-user quotas
//! - `clock` - time source, swappable in tests

pub mod claims;
pub mod clock;
pub mod error;
pub mod quota;
pub mod wishlists;

pub use claims::{Claim, ClaimCoordinator, ClaimError, ClaimLedger, LedgerViolation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QuotaRejection, Resource, ServiceError};
pub use quota::{
    Limit, QuotaClass, QuotaDecision, QuotaError, QuotaLedger, QuotaStatus, WindowStrategy,
};
pub use wishlists::{ClaimView, ItemView, Metered, ServiceLimits, WishlistService};
