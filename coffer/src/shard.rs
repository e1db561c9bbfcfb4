//! Shards: encrypted ordered maps from document paths to cells.
//!
//! A shard serialises to a line-separated text blob: a JSON header carrying
//! the key ring, then the encrypted index cell, then one encrypted cell per
//! document in index order. The shard id is part of every cell's context and
//! of the key ring MAC, and each item's path is part of its own context, so
//! neither a whole shard nor a single line can be replayed somewhere else.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::RwLock;

use coffer_base::canon::Context;
use coffer_base::{base64, Error, Result};

use crate::cell::Cell;
use crate::counters::Counters;
use crate::crypto::{Cipher, Verifier};
use crate::keyring::{KeyRing, KeyRingConfig, Limits};

/// Supported shard blob version.
const VERSION: u32 = 1;

/// Length of the random header tag.
const TAG_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    tag: String,
    cipher: KeyRingConfig,
}

struct State {
    index: Cell<Vec<String>>,
    items: Vec<Cell<Json>>,
}

/// One encrypted shard: a sorted set of paths and their documents.
///
/// All access is gated through an internal async lock. Reads decrypt lazily
/// and cache plaintext, so they also take the exclusive side of the lock;
/// the schedule runs at most one operation group per shard at a time, which
/// keeps this from ever being contended in practice.
#[derive(Debug)]
pub struct Shard {
    id: String,
    tag: [u8; TAG_LEN],
    keyring: Arc<KeyRing>,
    state: RwLock<State>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("items", &self.items.len())
            .finish()
    }
}

fn index_context(id: &str) -> Context {
    Context::new().with("file", id).with("scope", "index")
}

fn item_context(id: &str, path: &str) -> Context {
    Context::new()
        .with("file", id)
        .with("scope", "items")
        .with("path", path)
}

fn names_from(value: &Json) -> Result<Vec<String>> {
    let list = value
        .as_array()
        .ok_or_else(|| Error::Corrupt("directory entry is not an array".into()))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Corrupt("directory entry is not a string".into()))
        })
        .collect()
}

impl Shard {
    /// A fresh empty shard.
    pub fn create(
        id: &str,
        parent: Arc<dyn Cipher>,
        verifier: Verifier,
        limits: Limits,
    ) -> Self {
        let keyring = Arc::new(KeyRing::new(
            parent,
            verifier,
            Context::new().with("file", id),
            limits,
        ));
        let mut index = Cell::new(keyring.clone() as Arc<dyn Cipher>, index_context(id));
        index.set(Vec::new());
        Self {
            id: id.to_string(),
            tag: crate::crypto::random_bytes(),
            keyring,
            state: RwLock::new(State {
                index,
                items: Vec::new(),
            }),
        }
    }

    /// Parse a stored blob.
    ///
    /// The key ring MAC binds the shard id, so a blob loaded under the wrong
    /// id fails `AuthFailed` before any item is looked at. Structural
    /// problems (bad header, misaligned line count, unsorted index) fail
    /// `Corrupt`.
    pub fn parse(
        blob: &str,
        id: &str,
        parent: Arc<dyn Cipher>,
        verifier: Verifier,
        limits: Limits,
    ) -> Result<Self> {
        let lines: Vec<&str> = blob.split('\n').collect();
        if lines.len() < 2 {
            return Err(Error::Corrupt(format!("shard blob of {} lines", lines.len())));
        }
        let header: Header = serde_json::from_str(lines[0])
            .map_err(|err| Error::Corrupt(format!("shard header: {err}")))?;
        if header.version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported shard version {}",
                header.version
            )));
        }
        let tag: [u8; TAG_LEN] = base64::parse_array(&header.tag)?;
        let keyring = Arc::new(KeyRing::parse(
            &header.cipher,
            parent,
            verifier,
            Context::new().with("file", id),
            limits,
        )?);

        let mut index: Cell<Vec<String>> = Cell::from_ciphertext(
            keyring.clone() as Arc<dyn Cipher>,
            index_context(id),
            base64::parse_vec(lines[1])?,
        );
        let paths = index
            .get()?
            .ok_or_else(|| Error::Corrupt("empty index cell".into()))?
            .clone();
        if lines.len() != 2 + paths.len() {
            return Err(Error::Corrupt(format!(
                "{} item lines for {} indexed paths",
                lines.len() - 2,
                paths.len()
            )));
        }
        if paths.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Corrupt("index is not sorted".into()));
        }
        let items = paths
            .iter()
            .zip(&lines[2..])
            .map(|(path, line)| {
                Ok(Cell::from_ciphertext(
                    keyring.clone() as Arc<dyn Cipher>,
                    item_context(id, path),
                    base64::parse_vec(line)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: id.to_string(),
            tag,
            keyring: keyring.clone(),
            state: RwLock::new(State { index, items }),
        })
    }

    /// The shard id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of stored paths.
    pub async fn size(&self) -> usize {
        let state = self.state.read().await;
        state.index.cached().map(|paths| paths.len()).unwrap_or(0)
    }

    /// The document at `path`, deep-cloned, or `None`.
    pub async fn get(&self, path: &str) -> Result<Option<Json>> {
        let state = &mut *self.state.write().await;
        let pos = match Self::position(state, path)? {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };
        Ok(state.items[pos].get()?.cloned())
    }

    /// Upsert the document at `path` with `f(current)`.
    pub async fn put<F>(&self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(Option<Json>) -> Result<Json> + Send,
    {
        let state = &mut *self.state.write().await;
        match Self::position(state, path)? {
            Ok(pos) => state.items[pos].update(f)?,
            Err(pos) => {
                let value = f(None)?;
                state.index.update(|paths| {
                    let mut paths = paths.unwrap_or_default();
                    paths.insert(pos, path.to_string());
                    Ok(paths)
                })?;
                let mut cell = Cell::new(
                    self.keyring.clone() as Arc<dyn Cipher>,
                    item_context(&self.id, path),
                );
                cell.set(value);
                state.items.insert(pos, cell);
            }
        }
        Ok(())
    }

    /// Remove the document at `path` if present.
    pub async fn rm(&self, path: &str) -> Result<()> {
        let state = &mut *self.state.write().await;
        if let Ok(pos) = Self::position(state, path)? {
            Self::remove_at(state, pos)?;
        }
        Ok(())
    }

    /// The directory listing at `path`, deep-cloned, or `None`.
    pub async fn list(&self, path: &str) -> Result<Option<Vec<String>>> {
        let state = &mut *self.state.write().await;
        let pos = match Self::position(state, path)? {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };
        match state.items[pos].get()? {
            Some(value) => Ok(Some(names_from(value)?)),
            None => Ok(None),
        }
    }

    /// Insert `name` into the directory listing at `path`, creating it.
    pub async fn link(&self, path: &str, name: &str) -> Result<()> {
        self.put(path, |current| {
            let mut names = match &current {
                Some(value) => names_from(value)?,
                None => Vec::new(),
            };
            if let Err(pos) = names.binary_search_by(|n| n.as_str().cmp(name)) {
                names.insert(pos, name.to_string());
            }
            Ok(Json::from(names))
        })
        .await
    }

    /// Remove `name` from the directory listing at `path`.
    ///
    /// A listing that becomes empty is removed entirely.
    pub async fn unlink(&self, path: &str, name: &str) -> Result<()> {
        let state = &mut *self.state.write().await;
        let pos = match Self::position(state, path)? {
            Ok(pos) => pos,
            Err(_) => return Ok(()),
        };
        let mut names = match state.items[pos].get()? {
            Some(value) => names_from(value)?,
            None => return Ok(()),
        };
        if let Ok(at) = names.binary_search_by(|n| n.as_str().cmp(name)) {
            names.remove(at);
            if names.is_empty() {
                Self::remove_at(state, pos)?;
            } else {
                state.items[pos].set(Json::from(names));
            }
        }
        Ok(())
    }

    /// Serialise the shard to its stored text form.
    ///
    /// The key ring is serialised last so the header always reflects the
    /// counters charged while encrypting the index and items. Unmodified
    /// cells reproduce their stored bytes, so serialising an unchanged shard
    /// yields an identical blob.
    pub async fn serialize(&self) -> Result<String> {
        let state = &mut *self.state.write().await;
        let mut lines = Vec::with_capacity(2 + state.items.len());
        lines.push(String::new()); // header placeholder
        lines.push(base64::fmt(state.index.serialize()?));
        for item in &mut state.items {
            lines.push(base64::fmt(item.serialize()?));
        }
        let header = Header {
            version: VERSION,
            tag: base64::fmt(self.tag),
            cipher: self.keyring.serialize()?,
        };
        lines[0] = serde_json::to_string(&header)
            .map_err(|err| Error::Corrupt(format!("shard header: {err}")))?;
        Ok(lines.join("\n"))
    }

    /// Number of keys in the shard's key ring.
    pub fn keys(&self) -> usize {
        self.keyring.size()
    }

    /// Snapshot of the key ring counters.
    pub fn counters(&self) -> Counters {
        self.keyring.counters()
    }

    /// Fold retained counters from a conflicted write into this shard.
    pub fn merge_counters(&self, other: &Counters) {
        self.keyring.merge_counters(other);
    }

    /// Mark the counters committed after a successful write.
    pub fn commit_counters(&self) {
        self.keyring.commit_counters();
    }

    fn position(state: &mut State, path: &str) -> Result<std::result::Result<usize, usize>> {
        let paths = state
            .index
            .get()?
            .ok_or_else(|| Error::Corrupt("empty index cell".into()))?;
        Ok(paths.binary_search_by(|p| p.as_str().cmp(path)))
    }

    fn remove_at(state: &mut State, pos: usize) -> Result<()> {
        state.index.update(|paths| {
            let mut paths = paths.unwrap_or_default();
            paths.remove(pos);
            Ok(paths)
        })?;
        state.items.remove(pos);
        Ok(())
    }
}
