//! Claim ledger audit.
//!
//! Scans every claim ledger in the document store and reports items with
//! more than one active purchase, purchases filed under the wrong item, or
//! ledgers that no longer decode. Read-only.

use std::sync::Arc;

use wishlist_server::db::{self, Documents, PgStore};
use wishlist_server::services::ClaimCoordinator;

use super::{CommandError, database_url};

/// Audit all claim ledgers and return the number of violations found.
///
/// # Errors
///
/// Returns an error if the database is unreachable or listing fails.
pub async fn claims() -> Result<usize, CommandError> {
    let url = database_url()?;
    let pool = db::create_pool(&url).await?;
    let docs = Documents::new(Arc::new(PgStore::new(pool)));

    let violations = ClaimCoordinator::new(docs).audit().await?;
    for violation in &violations {
        tracing::error!(%violation, "Claim ledger violation");
    }
    tracing::info!(violations = violations.len(), "Claim ledger audit complete");

    Ok(violations.len())
}
