//! File-based storage: one file per blob under a root directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use data_encoding::HEXLOWER;

use coffer_base::{Error, Result};

use super::{rev_of, Store, Stored};

/// A [`Store`] writing each blob to `<root>/<hex(id)>.blob`.
///
/// Ids are hex-encoded so arbitrary id strings stay inside one flat
/// directory. Writes go through a temporary file and an atomic rename; the
/// revision check itself is read-then-write, which is safe for the
/// single-process deployments this adapter targets.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.blob", HEXLOWER.encode(id.as_bytes())))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn read(&self, id: &str) -> Result<Option<Stored>> {
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(value) => {
                let rev = rev_of(&value);
                Ok(Some(Stored { value, rev }))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, id: &str, value: &str, rev: Option<&str>) -> Result<String> {
        let path = self.path_for(id);
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => Some(rev_of(&existing)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if current.as_deref() != rev {
            return Err(Error::Conflict(format!("revision mismatch on {id}")));
        }
        let tmp = self.root.join(format!(
            ".tmp-{}",
            HEXLOWER.encode(&crate::crypto::random_bytes::<8>())
        ));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(rev_of(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        let rev = store.write("shard/one", "payload", None).await.unwrap();
        let stored = store.read("shard/one").await.unwrap().unwrap();
        assert_eq!(stored.value, "payload");
        assert_eq!(stored.rev, rev);
        assert_eq!(store.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        let rev = store.write("a", "one", None).await.unwrap();
        store.write("a", "two", Some(&rev)).await.unwrap();
        assert!(matches!(
            store.write("a", "three", Some(&rev)).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reopening_sees_existing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).await.unwrap();
            store.write("a", "persisted", None).await.unwrap();
        }
        let store = FileStore::new(dir.path()).await.unwrap();
        assert_eq!(
            store.read("a").await.unwrap().unwrap().value,
            "persisted"
        );
    }
}
