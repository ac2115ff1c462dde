//! Resource store: key-addressed documents with optimistic concurrency.
//!
//! The engine relies on exactly one atomic primitive: a single-document
//! compare-and-set against a version token read earlier. There are no
//! multi-document transactions; every invariant the engine protects is
//! scoped to one document.
//!
//! # Backends
//!
//! - [`MemoryStore`] - process-local, used by tests and when no database
//!   URL is configured
//! - [`PgStore`] - `PostgreSQL` table `wishlist.documents`
//! - [`TimeoutStore`] - wraps any backend and bounds every call
//!
//! # Key Layout
//!
//! ```text
//! wishlist:{wishlist_id}                → Wishlist (with item index)
//! owner:{user_id}                       → OwnerIndex
//! item:{item_id}                        → Item
//! claims:{item_id}                      → ClaimLedger
//! quota:{ledger}:{action}:{subject}     → quota counter
//! ```
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p wishlist-cli -- migrate
//! ```

mod memory;
mod postgres;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use timeout::TimeoutStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write precondition did not hold: another writer got there first.
    #[error("version conflict on {0}")]
    Conflict(String),

    /// The backend did not answer within the configured bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored document could not be decoded or encoded.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// The backend is otherwise unusable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque optimistic-concurrency token.
///
/// Tokens are never reused for a key, even across delete and re-create, so
/// a stale token can never match a newer document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(i64);

impl Version {
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Write only if no document exists under the key.
    Absent,
    /// Write only if the current document has exactly this version.
    Matches(Version),
}

impl Precondition {
    /// The precondition that re-asserts what a read observed.
    #[must_use]
    pub fn observed<T>(read: Option<&Versioned<T>>) -> Self {
        read.map_or(Self::Absent, |v| Self::Matches(v.version))
    }
}

/// Key-addressed document store with single-document compare-and-set.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Read a document and its version.
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError>;

    /// Write `value` under `key` if `precondition` holds, returning the new
    /// version. Returns [`StoreError::Conflict`] otherwise; nothing is
    /// written in that case.
    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        value: serde_json::Value,
    ) -> Result<Version, StoreError>;

    /// Delete a document. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List keys starting with `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Typed access to a [`ResourceStore`].
///
/// Cheap to clone; all clones share the same backend.
#[derive(Clone)]
pub struct Documents {
    store: Arc<dyn ResourceStore>,
}

impl Documents {
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Load and decode a document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DataCorruption` if the document does not decode
    /// as `T`, or any backend error.
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(raw.value)
            .map_err(|e| StoreError::DataCorruption(format!("{key}: {e}")))?;
        Ok(Some(Versioned {
            value,
            version: raw.version,
        }))
    }

    /// Encode and conditionally write a document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the precondition failed, or any
    /// backend error.
    pub async fn save<T: Serialize + Sync>(
        &self,
        key: &str,
        precondition: Precondition,
        value: &T,
    ) -> Result<Version, StoreError> {
        let raw = serde_json::to_value(value)
            .map_err(|e| StoreError::DataCorruption(format!("{key}: {e}")))?;
        self.store.compare_and_set(key, precondition, raw).await
    }

    /// Delete a document.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    /// List keys with the given prefix.
    ///
    /// # Errors
    ///
    /// Returns any backend error.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.store.list(prefix).await
    }
}

/// Document keys.
pub mod keys {
    use wishlist_core::{ItemId, UserId, WishlistId};

    #[must_use]
    pub fn wishlist(id: WishlistId) -> String {
        format!("wishlist:{id}")
    }

    #[must_use]
    pub fn owner(user: &UserId) -> String {
        format!("owner:{user}")
    }

    #[must_use]
    pub fn item(id: ItemId) -> String {
        format!("item:{id}")
    }

    #[must_use]
    pub fn claims(item: ItemId) -> String {
        format!("claims:{item}")
    }

    pub const CLAIMS_PREFIX: &str = "claims:";

    #[must_use]
    pub fn quota(ledger: &str, action: &str, subject: &str) -> String {
        format!("quota:{ledger}:{action}:{subject}")
    }
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
