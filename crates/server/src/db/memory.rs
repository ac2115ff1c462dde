//! In-memory resource store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Precondition, ResourceStore, StoreError, Version, Versioned};

/// Process-local [`ResourceStore`].
///
/// Versions come from one counter shared by every key, so a token is never
/// handed out twice.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    documents: Arc<Mutex<BTreeMap<String, Versioned<serde_json::Value>>>>,
    next_version: Arc<AtomicI64>,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Versioned<serde_json::Value>>>, StoreError>
    {
        self.documents
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        precondition: Precondition,
        value: serde_json::Value,
    ) -> Result<Version, StoreError> {
        let mut documents = self.lock()?;
        let current = documents.get(key).map(|d| d.version);
        let holds = match precondition {
            Precondition::Absent => current.is_none(),
            Precondition::Matches(expected) => current == Some(expected),
        };
        if !holds {
            return Err(StoreError::Conflict(key.to_owned()));
        }

        let version = Version::new(self.next_version.fetch_add(1, Ordering::Relaxed) + 1);
        documents.insert(key.to_owned(), Versioned { value, version });
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .range(prefix.to_owned()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_absent_precondition_only_creates() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", Precondition::Absent, json!(1))
            .await
            .unwrap();
        let err = store
            .compare_and_set("k", Precondition::Absent, json!(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let v1 = store
            .compare_and_set("k", Precondition::Absent, json!("a"))
            .await
            .unwrap();
        let v2 = store
            .compare_and_set("k", Precondition::Matches(v1), json!("b"))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        let err = store
            .compare_and_set("k", Precondition::Matches(v1), json!("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!("b"));
    }

    #[tokio::test]
    async fn test_versions_not_reused_after_delete() {
        let store = MemoryStore::new();
        let v1 = store
            .compare_and_set("k", Precondition::Absent, json!(1))
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        let v2 = store
            .compare_and_set("k", Precondition::Absent, json!(1))
            .await
            .unwrap();
        assert_ne!(v1, v2);
        let err = store
            .compare_and_set("k", Precondition::Matches(v1), json!(3))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        for key in ["claims:b", "claims:a", "item:a", "claimsx"] {
            store
                .compare_and_set(key, Precondition::Absent, json!(null))
                .await
                .unwrap();
        }
        assert_eq!(
            store.list("claims:").await.unwrap(),
            vec!["claims:a".to_string(), "claims:b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        assert!(MemoryStore::new().delete("nothing").await.is_ok());
    }
}
