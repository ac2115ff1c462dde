//! Bounded store calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{Precondition, ResourceStore, StoreError, Version, Versioned};

/// Wraps a [`ResourceStore`] so that no call waits longer than `limit`.
///
/// A timed-out `compare_and_set` may or may not have been applied by the
/// backend, but never partially: the backend's write is a single-document
/// atomic operation.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    limit: Duration,
}

impl<S> TimeoutStore<S> {
    #[must_use]
    pub const fn new(inner: S, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        key: &str,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        if let Ok(result) = tokio::time::timeout(self.limit, call).await {
            result
        } else {
            tracing::warn!(op, key, limit_ms = self.limit.as_millis(), "Store call timed out");
            Err(StoreError::Timeout(self.limit))
        }
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        value: serde_json::Value,
    ) -> Result<Version, StoreError> {
        self.bounded(
            "compare_and_set",
            key,
            self.inner.compare_and_set(key, precondition, value),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }
}
