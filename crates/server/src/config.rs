//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Optional
//! - `WISHLIST_DATABASE_URL` - `PostgreSQL` connection string (falls back to
//!   `DATABASE_URL`; without either the in-memory store is used)
//! - `WISHLIST_HOST` - Bind address (default: 127.0.0.1)
//! - `WISHLIST_PORT` - Listen port (default: 3000)
//! - `WISHLIST_STORE_TIMEOUT_MS` - Bound on every store call (default: 2000)
//! - `WISHLIST_API_TOKENS` - Bearer tokens, `token=userId:role` separated by
//!   `;` (each token min 32 chars, high entropy)
//! - `WISHLIST_QUOTA_STRATEGY` - `fixed` (default) or `sliding`
//! - `WISHLIST_CREATE_LIMIT` / `WISHLIST_CREATE_WINDOW_SECS` - (10 / 86400)
//! - `PURCHASE_CLAIM_LIMIT` / `PURCHASE_CLAIM_WINDOW_SECS` - (20 / 3600)
//! - `REQUEST_LIMIT_ANONYMOUS` / `_USER` / `_STORE_OWNER` / `_ADMIN` -
//!   requests per window by role (30 / 120 / 300 / 1000)
//! - `REQUEST_WINDOW_SECS` - request window (default: 60)
//! - `WISHLIST_TRUST_PROXY_HEADERS` - key anonymous clients on
//!   `CF-Connecting-IP` / `X-Forwarded-For` instead of the peer address.
//!   Only enable behind a proxy that overwrites them (default: false)
//! - `MAX_ITEMS_PER_WISHLIST` - (default: 100)
//! - `MAX_WISHLISTS_PER_USER` - (default: 50)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name
//!
//! Window lengths must be between 1 and 31622400 seconds (366 days).

use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use wishlist_core::{Identity, Role, UserId};

use crate::services::quota::{MAX_WINDOW_SECS, window_secs};
use crate::services::{Limit, QuotaClass, ServiceLimits, WindowStrategy};

const MIN_TOKEN_LENGTH: usize = 32;
const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// A bearer token and the identity it stands for.
#[derive(Clone)]
pub struct ApiToken {
    pub token: SecretString,
    pub identity: Identity,
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiToken")
            .field("token", &"[REDACTED]")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Limits for both quota ledgers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    pub strategy: WindowStrategy,
    pub wishlist_create: Limit,
    pub purchase_claim: Limit,
    /// Requests per `request_window` by role.
    pub requests: HashMap<Role, u32>,
    pub request_window: TimeDelta,
}

impl QuotaConfig {
    /// Limits for the action ledger.
    #[must_use]
    pub fn action_limits(&self) -> Vec<(QuotaClass, Limit)> {
        vec![
            (QuotaClass::WishlistCreate, self.wishlist_create),
            (QuotaClass::PurchaseClaim, self.purchase_claim),
        ]
    }

    /// Limits for the request ledger.
    #[must_use]
    pub fn request_limits(&self) -> Vec<(QuotaClass, Limit)> {
        self.requests
            .iter()
            .map(|(role, max)| {
                (
                    QuotaClass::Requests(*role),
                    Limit::new(*max, self.request_window),
                )
            })
            .collect()
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            strategy: WindowStrategy::Fixed,
            wishlist_create: Limit::per_seconds(10, 86_400),
            purchase_claim: Limit::per_seconds(20, 3_600),
            requests: HashMap::from([
                (Role::Anonymous, 30),
                (Role::User, 120),
                (Role::StoreOwner, 300),
                (Role::Admin, 1_000),
            ]),
            request_window: window_secs(60),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct WishlistConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: Option<SecretString>,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Upper bound on every store call
    pub store_timeout: Duration,
    /// Accepted bearer tokens
    pub api_tokens: Vec<ApiToken>,
    /// Quota limits
    pub quota: QuotaConfig,
    /// Item and wishlist ceilings
    pub limits: ServiceLimits,
    /// Whether client IP headers set by a fronting proxy are trusted
    pub trust_proxy_headers: bool,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

impl Default for WishlistConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            store_timeout: Duration::from_millis(2_000),
            api_tokens: Vec::new(),
            quota: QuotaConfig::default(),
            limits: ServiceLimits::default(),
            trust_proxy_headers: false,
            sentry_dsn: None,
            sentry_environment: None,
        }
    }
}

impl WishlistConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is invalid or if a token fails
    /// validation (length, placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = QuotaConfig::default();
        let requests = [
            (Role::Anonymous, "REQUEST_LIMIT_ANONYMOUS"),
            (Role::User, "REQUEST_LIMIT_USER"),
            (Role::StoreOwner, "REQUEST_LIMIT_STORE_OWNER"),
            (Role::Admin, "REQUEST_LIMIT_ADMIN"),
        ]
        .into_iter()
        .map(|(role, key)| {
            let default = defaults.requests.get(&role).copied().unwrap_or(0);
            get_parsed(key, default).map(|max| (role, max))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

        let quota = QuotaConfig {
            strategy: get_parsed("WISHLIST_QUOTA_STRATEGY", WindowStrategy::Fixed)?,
            wishlist_create: Limit::per_seconds(
                get_parsed("WISHLIST_CREATE_LIMIT", 10)?,
                get_window_secs("WISHLIST_CREATE_WINDOW_SECS", 86_400)?,
            ),
            purchase_claim: Limit::per_seconds(
                get_parsed("PURCHASE_CLAIM_LIMIT", 20)?,
                get_window_secs("PURCHASE_CLAIM_WINDOW_SECS", 3_600)?,
            ),
            requests,
            request_window: window_secs(get_window_secs("REQUEST_WINDOW_SECS", 60)?),
        };

        let api_tokens = match get_optional_env("WISHLIST_API_TOKENS") {
            Some(raw) => parse_api_tokens(&raw, "WISHLIST_API_TOKENS")?,
            None => Vec::new(),
        };

        Ok(Self {
            database_url: get_database_url("WISHLIST_DATABASE_URL"),
            host: get_parsed("WISHLIST_HOST", IpAddr::V4(Ipv4Addr::LOCALHOST))?,
            port: get_parsed("WISHLIST_PORT", 3000)?,
            store_timeout: Duration::from_millis(get_parsed("WISHLIST_STORE_TIMEOUT_MS", 2_000)?),
            api_tokens,
            quota,
            limits: ServiceLimits {
                max_items_per_wishlist: get_parsed("MAX_ITEMS_PER_WISHLIST", 100)?,
                max_wishlists_per_user: get_parsed("MAX_WISHLISTS_PER_USER", 50)?,
            },
            trust_proxy_headers: get_parsed("WISHLIST_TRUST_PROXY_HEADERS", false)?,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

// =============================================================================
// Token Table
// =============================================================================

/// Parse `token=userId:role` entries separated by `;`.
///
/// # Errors
///
/// Returns `ConfigError::InvalidEnvVar` for malformed entries and
/// `ConfigError::InsecureSecret` for weak tokens.
pub fn parse_api_tokens(raw: &str, var_name: &str) -> Result<Vec<ApiToken>, ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidEnvVar(var_name.to_string(), msg);
    let mut tokens = Vec::new();

    for (index, entry) in raw.split(';').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        let (token, subject) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("entry {index} is not token=userId:role")))?;
        let (user, role) = subject
            .split_once(':')
            .ok_or_else(|| invalid(format!("entry {index} is missing ':role'")))?;

        let user = UserId::parse(user.trim())
            .map_err(|e| invalid(format!("entry {index}: {e}")))?;
        let role = Role::from_str(role.trim())
            .map_err(|e| invalid(format!("entry {index}: {e}")))?;
        if role == Role::Anonymous {
            return Err(invalid(format!("entry {index}: tokens cannot map to anonymous")));
        }

        let token = SecretString::from(token.trim().to_owned());
        validate_token_length(&token, var_name)?;
        validate_secret_strength(token.expose_secret(), var_name)?;

        tokens.push(ApiToken {
            token,
            identity: Identity::new(user, role),
        });
    }

    Ok(tokens)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get database URL with fallback to generic `DATABASE_URL` (used by Fly.io postgres attach).
fn get_database_url(primary_key: &str) -> Option<SecretString> {
    std::env::var(primary_key)
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
        .map(SecretString::from)
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse an environment variable, falling back to `default` when unset.
fn get_parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Parse a window length in seconds, falling back to `default` when unset.
fn get_window_secs(key: &str, default: u64) -> Result<u64, ConfigError> {
    check_window_secs(key, get_parsed(key, default)?)
}

fn check_window_secs(key: &str, secs: u64) -> Result<u64, ConfigError> {
    if (1..=MAX_WINDOW_SECS).contains(&secs) {
        Ok(secs)
    } else {
        Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            format!("window must be between 1 and {MAX_WINDOW_SECS} seconds (got {secs})"),
        ))
    }
}

/// Validate that a token meets minimum length requirements.
fn validate_token_length(secret: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = secret.expose_secret();
    if value.len() < MIN_TOKEN_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "tokens must be at least {} characters (got {})",
                MIN_TOKEN_LENGTH,
                value.len()
            ),
        ));
    }
    Ok(())
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("token appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "token entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated token."
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const BOB_TOKEN: &str = "k9Vq2xLp7RtZ4mWc8NbY3hJf6GdS1aEu";
    const MOD_TOKEN: &str = "Qz7Lm2Xc9Vb4Nr8Tk1Pw6Hy3Jd5Fg0Sa";

    #[test]
    fn test_shannon_entropy() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("ab") - 1.0).abs() < 0.01);
        assert!(shannon_entropy(BOB_TOKEN) > MIN_ENTROPY_BITS_PER_CHAR);
    }

    #[test]
    fn test_parse_api_tokens() {
        let raw = format!("{BOB_TOKEN}=bob:user; {MOD_TOKEN}=mod:admin;");
        let tokens = parse_api_tokens(&raw, "TEST").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].identity, Identity::user(UserId::parse("bob").unwrap()));
        assert!(tokens[1].identity.is_admin());
        assert_eq!(tokens[1].token.expose_secret(), MOD_TOKEN);
    }

    #[test]
    fn test_parse_api_tokens_accepts_store_owner_spellings() {
        let raw = format!("{BOB_TOKEN}=shop:storeOwner");
        let tokens = parse_api_tokens(&raw, "TEST").unwrap();
        assert_eq!(tokens[0].identity.role(), Role::StoreOwner);
    }

    #[test]
    fn test_parse_api_tokens_rejects_malformed_entries() {
        for raw in [
            BOB_TOKEN.to_string(),
            format!("{BOB_TOKEN}=bob"),
            format!("{BOB_TOKEN}=bob:wizard"),
            format!("{BOB_TOKEN}=:user"),
            format!("{BOB_TOKEN}=bob:anonymous"),
        ] {
            assert!(
                matches!(
                    parse_api_tokens(&raw, "TEST"),
                    Err(ConfigError::InvalidEnvVar(_, _))
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_api_tokens_rejects_weak_tokens() {
        for token in ["short", "changeme-changeme-changeme-changeme", &"a".repeat(40)] {
            let raw = format!("{token}=bob:user");
            assert!(matches!(
                parse_api_tokens(&raw, "TEST"),
                Err(ConfigError::InsecureSecret(_, _))
            ));
        }
    }

    #[test]
    fn test_api_token_debug_redacts_secret() {
        let tokens = parse_api_tokens(&format!("{BOB_TOKEN}=bob:user"), "TEST").unwrap();
        let debug_output = format!("{tokens:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(BOB_TOKEN));
    }

    #[test]
    fn test_quota_defaults() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.wishlist_create.max, 10);
        assert_eq!(quota.purchase_claim.max, 20);
        let requests = quota.request_limits();
        assert_eq!(requests.len(), 4);
        assert!(requests.contains(&(
            QuotaClass::Requests(Role::Anonymous),
            Limit::per_seconds(30, 60)
        )));
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(check_window_secs("W", 1).unwrap(), 1);
        assert_eq!(check_window_secs("W", MAX_WINDOW_SECS).unwrap(), MAX_WINDOW_SECS);
        for secs in [0, MAX_WINDOW_SECS + 1, u64::MAX] {
            let err = check_window_secs("PURCHASE_CLAIM_WINDOW_SECS", secs).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidEnvVar(ref key, _) if key == "PURCHASE_CLAIM_WINDOW_SECS"
            ));
        }
    }

    #[test]
    fn test_proxy_headers_untrusted_by_default() {
        assert!(!WishlistConfig::default().trust_proxy_headers);
    }

    #[test]
    fn test_socket_addr() {
        let config = WishlistConfig {
            port: 8080,
            ..WishlistConfig::default()
        };
        let addr = config.socket_addr();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 8080);
    }
}
