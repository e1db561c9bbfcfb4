//! In-memory storage, used by tests and as the reference adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use coffer_base::{Error, Result};

use super::{rev_of, Store, Stored};

/// A [`Store`] backed by a mutex-guarded map.
///
/// Cloning shares the underlying map, so several clients can race against
/// one store in tests.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemStore {
    /// A fresh empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn read(&self, id: &str) -> Result<Option<Stored>> {
        let entries = self.entries.lock();
        Ok(entries.get(id).map(|value| Stored {
            value: value.clone(),
            rev: rev_of(value),
        }))
    }

    async fn write(&self, id: &str, value: &str, rev: Option<&str>) -> Result<String> {
        let mut entries = self.entries.lock();
        let current = entries.get(id).map(|v| rev_of(v));
        if current.as_deref() != rev {
            return Err(Error::Conflict(format!("revision mismatch on {id}")));
        }
        entries.insert(id.to_string(), value.to_string());
        Ok(rev_of(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update() {
        let store = MemStore::new();
        assert_eq!(store.read("a").await.unwrap(), None);

        let rev = store.write("a", "one", None).await.unwrap();
        let stored = store.read("a").await.unwrap().unwrap();
        assert_eq!(stored.value, "one");
        assert_eq!(stored.rev, rev);

        let rev2 = store.write("a", "two", Some(&rev)).await.unwrap();
        assert_ne!(rev, rev2);
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let store = MemStore::new();
        let rev = store.write("a", "one", None).await.unwrap();
        store.write("a", "two", Some(&rev)).await.unwrap();
        assert!(matches!(
            store.write("a", "three", Some(&rev)).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn create_over_existing_conflicts() {
        let store = MemStore::new();
        store.write("a", "one", None).await.unwrap();
        assert!(matches!(
            store.write("a", "two", None).await,
            Err(Error::Conflict(_))
        ));
    }
}
