//! Configuration check.

use wishlist_server::config::{ConfigError, WishlistConfig};

/// Load the server configuration exactly as the server would and summarize
/// it. Secrets are never logged.
///
/// # Errors
///
/// Returns the first configuration problem found.
pub fn check() -> Result<(), ConfigError> {
    let config = WishlistConfig::from_env()?;

    tracing::info!(
        addr = %config.socket_addr(),
        database = config.database_url.is_some(),
        tokens = config.api_tokens.len(),
        strategy = ?config.quota.strategy,
        store_timeout_ms = config.store_timeout.as_millis(),
        "Configuration OK"
    );
    for token in &config.api_tokens {
        tracing::info!(identity = ?token.identity, "API token");
    }
    Ok(())
}
