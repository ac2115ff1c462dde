//! Caller identity resolution.
//!
//! [`resolve_identity`] runs once per API request: it reads the
//! `Authorization: Bearer` header, verifies it with the configured
//! [`IdentityVerifier`], and stores the resulting [`Identity`] in the
//! request extensions. A request without the header is anonymous; a header
//! that does not verify is refused with 401.
//!
//! Handlers take the identity with the [`CurrentIdentity`] extractor.

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use thiserror::Error;
use wishlist_core::Identity;

use crate::config::ApiToken;
use crate::error::{AppError, set_sentry_user};
use crate::state::AppState;

/// The bearer token did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unauthenticated")]
pub struct Unauthenticated;

/// Turns a bearer credential into an [`Identity`].
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `bearer`.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` if the credential is unknown or invalid.
    fn verify(&self, bearer: &str) -> Result<Identity, Unauthenticated>;
}

/// Verifies bearer tokens against a static table from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenTableVerifier {
    tokens: Vec<ApiToken>,
}

impl TokenTableVerifier {
    #[must_use]
    pub const fn new(tokens: Vec<ApiToken>) -> Self {
        Self { tokens }
    }
}

impl IdentityVerifier for TokenTableVerifier {
    fn verify(&self, bearer: &str) -> Result<Identity, Unauthenticated> {
        self.tokens
            .iter()
            .find(|t| constant_time_eq(t.token.expose_secret().as_bytes(), bearer.as_bytes()))
            .map(|t| t.identity.clone())
            .ok_or(Unauthenticated)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware that resolves the caller's identity.
///
/// Must run before anything that reads [`CurrentIdentity`].
pub async fn resolve_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().map(str::trim));

    let identity = match header {
        None => Identity::anonymous(),
        Some(Ok(value)) => {
            let Some(token) = value.strip_prefix("Bearer ") else {
                return AppError::InvalidCredentials.into_response();
            };
            match state.verifier().verify(token.trim()) {
                Ok(identity) => identity,
                Err(Unauthenticated) => {
                    tracing::info!("Rejected unknown bearer token");
                    return AppError::InvalidCredentials.into_response();
                }
            }
        }
        Some(Err(_)) => return AppError::InvalidCredentials.into_response(),
    };

    if let Some(user) = identity.user_id() {
        set_sentry_user(user);
    }
    tracing::Span::current().record("role", tracing::field::display(identity.role()));

    request.extensions_mut().insert(identity);
    next.run(request).await
}

/// Extractor for the caller's identity.
///
/// Falls back to the anonymous identity when [`resolve_identity`] did not
/// run, so a missing layer can only ever reduce access.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(CurrentIdentity(identity): CurrentIdentity) -> impl IntoResponse {
///     identity.role().to_string()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentIdentity(pub Identity);

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<Identity>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}
