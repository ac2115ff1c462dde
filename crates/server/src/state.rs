//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::WishlistConfig;
use crate::db::{Documents, ResourceStore, TimeoutStore};
use crate::middleware::auth::{IdentityVerifier, TokenTableVerifier};
use crate::services::{Clock, QuotaLedger, SystemClock, WishlistService};

/// Store namespace of the action ledger.
pub const ACTION_LEDGER: &str = "action";
/// Store namespace of the request ledger.
pub const REQUEST_LEDGER: &str = "request";

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc` and provides access to the
/// wishlist service, the request ledger and the identity verifier.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: WishlistConfig,
    documents: Documents,
    service: WishlistService,
    request_ledger: QuotaLedger,
    verifier: Arc<dyn IdentityVerifier>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create application state over `store`, using the wall clock.
    ///
    /// Every store call is bounded by `config.store_timeout`.
    pub fn new<S: ResourceStore>(config: WishlistConfig, store: S) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create application state with an explicit clock.
    pub fn with_clock<S: ResourceStore>(
        config: WishlistConfig,
        store: S,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let documents = Documents::new(Arc::new(TimeoutStore::new(store, config.store_timeout)));

        let action_ledger = QuotaLedger::new(
            ACTION_LEDGER,
            documents.clone(),
            config.quota.strategy,
            config.quota.action_limits(),
        );
        let request_ledger = QuotaLedger::new(
            REQUEST_LEDGER,
            documents.clone(),
            config.quota.strategy,
            config.quota.request_limits(),
        );
        let service = WishlistService::new(
            documents.clone(),
            action_ledger,
            Arc::clone(&clock),
            config.limits,
        );
        let verifier = Arc::new(TokenTableVerifier::new(config.api_tokens.clone()));

        Self {
            inner: Arc::new(AppStateInner {
                config,
                documents,
                service,
                request_ledger,
                verifier,
                clock,
            }),
        }
    }

    /// Get a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &WishlistConfig {
        &self.inner.config
    }

    /// Get a reference to the typed document store.
    #[must_use]
    pub fn documents(&self) -> &Documents {
        &self.inner.documents
    }

    /// Get a reference to the wishlist service.
    #[must_use]
    pub fn service(&self) -> &WishlistService {
        &self.inner.service
    }

    /// Get a reference to the per-role request ledger.
    #[must_use]
    pub fn request_ledger(&self) -> &QuotaLedger {
        &self.inner.request_ledger
    }

    /// Get a reference to the bearer-token verifier.
    #[must_use]
    pub fn verifier(&self) -> &dyn IdentityVerifier {
        self.inner.verifier.as_ref()
    }

    /// Get a reference to the clock.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }
}
