//! The shard cache: the only reader and writer of shard blobs.
//!
//! Each shard id has at most one in-memory [`Shard`] and at most one
//! in-flight load; concurrent readers of the same id share the same future,
//! so two tasks can never observe two divergent copies of one shard. Writes
//! are optimistic: a revision mismatch evicts the cached shard but keeps its
//! usage counters, which are folded into the next successful load so key
//! usage survives the retry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

use coffer_base::{Error, Kind, Result};

use crate::counters::Counters;
use crate::crypto::{Cipher, Verifier};
use crate::keyring::Limits;
use crate::shard::Shard;
use crate::store::Store;

type Loaded = (Arc<Shard>, Option<String>);
type LoadFuture = Shared<BoxFuture<'static, Result<Loaded>>>;

enum Entry {
    Loading(LoadFuture),
    Ready {
        shard: Arc<Shard>,
        rev: Option<String>,
    },
}

/// Caches shards above a [`Store`], with conflict recovery.
pub struct ShardCache {
    store: Arc<dyn Store>,
    master: Arc<dyn Cipher>,
    verifier: Verifier,
    limits: Limits,
    entries: Mutex<HashMap<String, Entry>>,
    /// Counter bags retained from conflicted writes, keyed by shard id.
    retained: Mutex<HashMap<String, Counters>>,
}

impl fmt::Debug for ShardCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardCache")
            .field("entries", &self.entries.lock().len())
            .field("retained", &self.retained.lock().len())
            .finish()
    }
}

impl ShardCache {
    /// A cache over `store`, decrypting under `master` and `verifier`.
    pub fn new(
        store: Arc<dyn Store>,
        master: Arc<dyn Cipher>,
        verifier: Verifier,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            master,
            verifier,
            limits,
            entries: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        }
    }

    /// The shard at `id`, loading it if necessary.
    ///
    /// A missing blob yields a fresh empty shard with no stored revision.
    /// Counters retained from an earlier conflicted write are merged into
    /// the freshly loaded shard exactly once.
    pub async fn read(&self, id: &str) -> Result<Arc<Shard>> {
        let fut = {
            let mut entries = self.entries.lock();
            match entries.get(id) {
                Some(Entry::Ready { shard, .. }) => return Ok(shard.clone()),
                Some(Entry::Loading(fut)) => fut.clone(),
                None => {
                    trace!(shard = id, "loading");
                    let fut = self.load_future(id);
                    entries.insert(id.to_string(), Entry::Loading(fut.clone()));
                    fut
                }
            }
        };
        match fut.clone().await {
            Ok((shard, rev)) => {
                let mut entries = self.entries.lock();
                let ours = matches!(
                    entries.get(id),
                    Some(Entry::Loading(current)) if current.ptr_eq(&fut)
                );
                if ours {
                    if let Some(retained) = self.retained.lock().remove(id) {
                        debug!(shard = id, "merging retained counters");
                        shard.merge_counters(&retained);
                    }
                    entries.insert(
                        id.to_string(),
                        Entry::Ready {
                            shard: shard.clone(),
                            rev,
                        },
                    );
                }
                Ok(shard)
            }
            Err(err) => {
                // Clear the slot so a later read can retry the fetch.
                let mut entries = self.entries.lock();
                let ours = matches!(
                    entries.get(id),
                    Some(Entry::Loading(current)) if current.ptr_eq(&fut)
                );
                if ours {
                    entries.remove(id);
                }
                Err(err)
            }
        }
    }

    /// Serialise and write back the cached shard at `id`.
    ///
    /// Success commits the shard's counters and records the new revision. A
    /// `Conflict` evicts the entry, retains the counters, and re-raises;
    /// other errors pass through without eviction.
    pub async fn write(&self, id: &str) -> Result<()> {
        let (shard, rev) = {
            let entries = self.entries.lock();
            match entries.get(id) {
                Some(Entry::Ready { shard, rev }) => (shard.clone(), rev.clone()),
                _ => return Err(Error::Missing(format!("shard {id} not loaded"))),
            }
        };
        let blob = shard.serialize().await?;
        match self.store.write(id, &blob, rev.as_deref()).await {
            Ok(new_rev) => {
                shard.commit_counters();
                let mut entries = self.entries.lock();
                if let Some(Entry::Ready { rev, .. }) = entries.get_mut(id) {
                    *rev = Some(new_rev);
                }
                trace!(shard = id, "written");
                Ok(())
            }
            Err(err) if err.kind() == Kind::Conflict => {
                debug!(shard = id, "write conflict, evicting");
                self.retained
                    .lock()
                    .insert(id.to_string(), shard.counters());
                self.entries.lock().remove(id);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the cached shard at `id`, if any.
    ///
    /// Used after a group fails mid-application: the in-memory shard may
    /// carry mutations that never reached storage, so the next read starts
    /// from the last committed state. Plaintext edits charge no counters,
    /// so nothing needs retaining.
    pub fn evict(&self, id: &str) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(id), Some(Entry::Ready { .. })) {
            debug!(shard = id, "evicting dirty shard");
            entries.remove(id);
        }
    }

    fn load_future(&self, id: &str) -> LoadFuture {
        let store = self.store.clone();
        let master = self.master.clone();
        let verifier = self.verifier.clone();
        let limits = self.limits;
        let id = id.to_string();
        async move {
            match store.read(&id).await? {
                Some(stored) => {
                    let shard = Shard::parse(&stored.value, &id, master, verifier, limits)?;
                    Ok((Arc::new(shard), Some(stored.rev)))
                }
                None => Ok((
                    Arc::new(Shard::create(&id, master, verifier, limits)),
                    None,
                )),
            }
        }
        .boxed()
        .shared()
    }
}
