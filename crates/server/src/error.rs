//! Unified error handling and the JSON response envelope.
//!
//! Every API response body has the shape
//!
//! ```json
//! { "success": false, "data": null, "error": { "kind": "NOT_FOUND", "message": "item not found" } }
//! ```
//!
//! Quota-bound responses also carry `limit`, `remaining` and `resetAt`.
//! Server-side failures are captured to Sentry before responding with a
//! generic message. Permission denials always render the same message, so
//! an owner-blindness refusal cannot be told apart from any other.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::services::{QuotaStatus, ServiceError};

/// Error body inside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

/// Quota fields flattened into the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaFields {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl From<QuotaStatus> for QuotaFields {
    fn from(status: QuotaStatus) -> Self {
        Self {
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
        }
    }
}

/// The response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaFields>,
}

/// A successful response.
#[derive(Debug)]
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
    quota: Option<QuotaFields>,
}

impl<T: Serialize> ApiResponse<T> {
    /// `200 OK` with `data`.
    pub const fn ok(data: T) -> Self {
        Self {
            status: StatusCode::OK,
            data,
            quota: None,
        }
    }

    /// `201 Created` with `data`.
    pub const fn created(data: T) -> Self {
        Self {
            status: StatusCode::CREATED,
            data,
            quota: None,
        }
    }

    /// Attach the remaining allowance.
    #[must_use]
    pub fn with_quota(mut self, status: QuotaStatus) -> Self {
        self.quota = Some(status.into());
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = Envelope {
            success: true,
            data: Some(self.data),
            error: None,
            quota: self.quota,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Application-level error type for the API.
#[derive(Debug, Error)]
pub enum AppError {
    /// A service operation failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The bearer token was present but not recognized.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Malformed request (query string, JSON body, path).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The edge limiter refused the client's address.
    #[error("too many requests, retry in {wait_secs}s")]
    Throttled { wait_secs: u64 },

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Service(err) => match err {
                ServiceError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
                ServiceError::PermissionDenied(_) => "PERMISSION_DENIED",
                ServiceError::NotFound(_) => "NOT_FOUND",
                ServiceError::Validation(_) => "VALIDATION_ERROR",
                ServiceError::AlreadyClaimed => "ALREADY_CLAIMED",
                ServiceError::Conflict => "CONFLICT",
                ServiceError::LimitExceeded(_) => "LIMIT_EXCEEDED",
                ServiceError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
                ServiceError::Unavailable(_) => "UNAVAILABLE",
                ServiceError::Timeout(_) => "TIMEOUT",
            },
            Self::InvalidCredentials => "AUTHENTICATION_REQUIRED",
            Self::BadRequest(_) => "VALIDATION_ERROR",
            Self::Throttled { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Service(err) => match err {
                ServiceError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
                ServiceError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
                ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
                ServiceError::AlreadyClaimed | ServiceError::Conflict => StatusCode::CONFLICT,
                ServiceError::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ServiceError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
                ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            },
            Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the client.
    fn public_message(&self) -> String {
        match self {
            Self::Service(err) => match err {
                // Fixed text so denials never differ by reason.
                ServiceError::PermissionDenied(_) => "permission denied".to_string(),
                ServiceError::Unavailable(_) => "Service temporarily unavailable".to_string(),
                ServiceError::Timeout(_) => "Storage did not respond in time".to_string(),
                ServiceError::RateLimitExceeded(_) => "Rate limit exceeded".to_string(),
                other => other.to_string(),
            },
            Self::Throttled { .. } => "Rate limit exceeded".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    const fn is_server_fault(&self) -> bool {
        matches!(
            self,
            Self::Internal(_)
                | Self::Service(ServiceError::Unavailable(_) | ServiceError::Timeout(_))
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Capture server errors to Sentry
        if self.is_server_fault() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                kind = self.kind(),
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(kind = self.kind(), "Request refused");
        }

        let quota = match &self {
            Self::Service(ServiceError::RateLimitExceeded(rejection)) => {
                Some(QuotaFields::from(rejection.status))
            }
            _ => None,
        };

        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: self.kind(),
                message: self.public_message(),
            }),
            quota,
        };

        let retry_after = match (&self, quota) {
            (Self::Throttled { wait_secs }, _) => Some((*wait_secs).max(1)),
            (_, Some(quota)) => Some(
                u64::try_from((quota.reset_at - Utc::now()).num_seconds())
                    .unwrap_or(0)
                    .max(1),
            ),
            _ => None,
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(wait) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&wait.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

/// Set the Sentry user context from a user ID.
///
/// Call this after the caller's identity is resolved to associate errors
/// with users.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use http_body_util::BodyExt;
    use wishlist_core::{Denial, ForbiddenReason};

    use super::*;
    use crate::services::{QuotaClass, QuotaRejection, Resource};

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let response = ApiResponse::ok(serde_json::json!({"id": 1})).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 1);
        assert!(body["error"].is_null());
        assert!(body.get("limit").is_none());
    }

    #[tokio::test]
    async fn test_success_envelope_with_quota() {
        let reset_at = DateTime::from_timestamp(1_700_003_600, 0).unwrap();
        let response = ApiResponse::created("ok")
            .with_quota(QuotaStatus {
                limit: 20,
                remaining: 19,
                reset_at,
            })
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["limit"], 20);
        assert_eq!(body["remaining"], 19);
        assert_eq!(body["resetAt"], "2023-11-14T23:13:20Z");
    }

    #[tokio::test]
    async fn test_error_kinds_and_statuses() {
        let cases = [
            (
                AppError::from(ServiceError::AuthenticationRequired),
                StatusCode::UNAUTHORIZED,
                "AUTHENTICATION_REQUIRED",
            ),
            (
                AppError::from(ServiceError::NotFound(Resource::Item)),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
            (
                AppError::from(ServiceError::AlreadyClaimed),
                StatusCode::CONFLICT,
                "ALREADY_CLAIMED",
            ),
            (
                AppError::from(ServiceError::Conflict),
                StatusCode::CONFLICT,
                "CONFLICT",
            ),
            (
                AppError::from(ServiceError::LimitExceeded("full".to_string())),
                StatusCode::UNPROCESSABLE_ENTITY,
                "LIMIT_EXCEEDED",
            ),
            (
                AppError::from(ServiceError::Timeout(Duration::from_secs(2))),
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
            ),
            (
                AppError::BadRequest("bad json".to_string()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
            ),
        ];
        for (err, status, kind) in cases {
            let response = err.into_response();
            assert_eq!(response.status(), status);
            let body = response_json(response).await;
            assert_eq!(body["success"], false);
            assert_eq!(body["error"]["kind"], kind);
        }
    }

    #[tokio::test]
    async fn test_denials_render_identically() {
        let blind = AppError::from(ServiceError::PermissionDenied(Denial::OwnerBlind));
        let forbidden = AppError::from(ServiceError::PermissionDenied(Denial::Forbidden(
            ForbiddenReason::NotOwner,
        )));
        let blind = response_json(blind.into_response()).await;
        let forbidden = response_json(forbidden.into_response()).await;
        assert_eq!(blind, forbidden);
    }

    #[tokio::test]
    async fn test_unavailable_hides_details() {
        let err = AppError::from(ServiceError::Unavailable(
            "connection to 10.0.0.3 refused".to_string(),
        ));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response_json(response).await;
        assert!(!body.to_string().contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_quota_and_retry_after() {
        let reset_at = Utc::now() + TimeDelta::try_minutes(30).unwrap();
        let err = AppError::from(ServiceError::RateLimitExceeded(QuotaRejection {
            class: QuotaClass::PurchaseClaim,
            status: QuotaStatus {
                limit: 20,
                remaining: 0,
                reset_at,
            },
        }));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let retry_after: i64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=1800).contains(&retry_after));

        let body = response_json(response).await;
        assert_eq!(body["error"]["kind"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["limit"], 20);
        assert_eq!(body["remaining"], 0);
        assert!(body["resetAt"].is_string());
    }
}
