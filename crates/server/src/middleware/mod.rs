//! HTTP middleware stack.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (capture errors, transactions)
//! 2. `TraceLayer` (request spans)
//! 3. Request ID
//! 4. Edge rate limiting (per-IP `governor` bucket)
//! 5. Identity resolution (bearer token → `Identity`)
//! 6. Request quota (per-role windowed limit)

pub mod auth;
pub mod rate_limit;
pub mod request_id;

pub use auth::{CurrentIdentity, IdentityVerifier, TokenTableVerifier, resolve_identity};
pub use rate_limit::{edge_rate_limiter, request_quota};
pub use request_id::{RequestId, request_id_middleware};
