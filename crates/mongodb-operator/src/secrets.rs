//! Secret storage for certificates and agent keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::OperatorResult;

/// Key/value contents of a secret.
pub type SecretData = BTreeMap<String, String>;

/// Namespaced secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret; `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<SecretData>>;

    /// Create or replace a secret.
    async fn put(&self, namespace: &str, name: &str, data: SecretData) -> OperatorResult<()>;

    /// Delete a secret, returning whether it existed.
    async fn delete(&self, namespace: &str, name: &str) -> OperatorResult<bool>;
}

fn storage_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct MemorySecrets {
    data: Arc<RwLock<HashMap<String, SecretData>>>,
    writes: Arc<AtomicU64>,
}

impl MemorySecrets {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the secrets stored in `namespace`, sorted.
    pub async fn names(&self, namespace: &str) -> Vec<String> {
        let prefix = storage_key(namespace, "");
        let data = self.data.read().await;
        let mut names: Vec<String> = data
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(str::to_owned)
            .collect();
        names.sort();
        names
    }

    /// Number of writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemorySecrets {
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<SecretData>> {
        let data = self.data.read().await;
        Ok(data.get(&storage_key(namespace, name)).cloned())
    }

    async fn put(&self, namespace: &str, name: &str, secret: SecretData) -> OperatorResult<()> {
        let mut data = self.data.write().await;
        data.insert(storage_key(namespace, name), secret);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> OperatorResult<bool> {
        let mut data = self.data.write().await;
        Ok(data.remove(&storage_key(namespace, name)).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemorySecrets::new();
        assert!(store.get("ns", "s").await.unwrap().is_none());

        let data = SecretData::from([("key".to_owned(), "value".to_owned())]);
        store.put("ns", "s", data.clone()).await.unwrap();
        assert_eq!(store.get("ns", "s").await.unwrap(), Some(data));
        assert!(store.get("other", "s").await.unwrap().is_none());
        assert_eq!(store.write_count(), 1);

        assert!(store.delete("ns", "s").await.unwrap());
        assert!(!store.delete("ns", "s").await.unwrap());
    }

    #[tokio::test]
    async fn names_are_scoped_to_the_namespace() {
        let store = MemorySecrets::new();
        for (ns, name) in [("ns", "b"), ("ns", "a"), ("other", "c")] {
            store.put(ns, name, SecretData::new()).await.unwrap();
        }
        assert_eq!(store.names("ns").await, ["a", "b"]);
        assert!(store.names("missing").await.is_empty());
    }
}
