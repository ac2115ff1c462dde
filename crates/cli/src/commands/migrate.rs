//! Database migration command.
//!
//! # Usage
//!
//! ```bash
//! wl-cli migrate
//! ```
//!
//! # Environment Variables
//!
//! - `WISHLIST_DATABASE_URL` (or `DATABASE_URL`) - `PostgreSQL` connection string
//!
//! Migrations live in `crates/server/migrations/` and are embedded at
//! compile time.

use wishlist_server::db;

use super::{CommandError, database_url};

/// Apply pending migrations to the document store database.
///
/// # Errors
///
/// Returns an error if the database URL is missing, the connection fails,
/// or a migration fails to apply.
pub async fn run() -> Result<(), CommandError> {
    let url = database_url()?;

    tracing::info!("Connecting to wishlist database...");
    let pool = db::create_pool(&url).await?;

    tracing::info!("Running wishlist migrations...");
    sqlx::migrate!("../server/migrations").run(&pool).await?;

    tracing::info!("Wishlist migrations complete!");
    Ok(())
}
