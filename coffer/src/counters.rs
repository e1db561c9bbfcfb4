//! Named usage counters with commit baselines and conflict merging.
//!
//! Each key in a key ring owns a pair of counters tracking how many messages
//! and how many cipher blocks it has protected. The counters ride along with
//! the shard blob; after a lost optimistic write the local increments are
//! folded into the freshly loaded remote state so that key usage is never
//! under-counted across writers.

use std::collections::BTreeMap;

use coffer_base::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counter {
    /// Baseline at the last committed read or write.
    init: u64,
    value: u64,
}

/// A bag of named monotonic `u64` counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    entries: BTreeMap<String, Counter>,
}

impl Counters {
    /// An empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh counter at zero.
    ///
    /// Fails `Counter` when the id is already present: counter ids track key
    /// sequence numbers, which are never reused.
    pub fn insert(&mut self, id: &str) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(Error::Counter(format!("duplicate counter {id}")));
        }
        self.entries
            .insert(id.to_string(), Counter { init: 0, value: 0 });
        Ok(())
    }

    /// Register a counter restored from storage.
    ///
    /// The stored value doubles as the committed baseline.
    pub fn restore(&mut self, id: &str, value: u64) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(Error::Counter(format!("duplicate counter {id}")));
        }
        self.entries
            .insert(id.to_string(), Counter { init: value, value });
        Ok(())
    }

    /// Increment a counter, returning the new value.
    pub fn add(&mut self, id: &str, delta: u64) -> Result<u64> {
        let counter = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::Counter(format!("unknown counter {id}")))?;
        counter.value += delta;
        Ok(counter.value)
    }

    /// The current value of a counter.
    pub fn get(&self, id: &str) -> Option<u64> {
        self.entries.get(id).map(|c| c.value)
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the current values as the new committed baselines.
    ///
    /// Called after the state holding these values reached storage.
    pub fn commit(&mut self) {
        for counter in self.entries.values_mut() {
            counter.init = counter.value;
        }
    }

    /// Fold another bag's uncommitted increments into this one.
    ///
    /// For every id present in both bags, `other.value - other.init` is added
    /// here. Ids absent locally are ignored: they name key material this
    /// state does not carry. Entries with a zero baseline are skipped; a
    /// baseline that was never established by a committed read or write
    /// refers to keys that never reached storage, so their usage died with
    /// the failed write.
    pub fn merge(&mut self, other: &Counters) {
        for (id, theirs) in &other.entries {
            if theirs.init == 0 {
                continue;
            }
            if let Some(ours) = self.entries.get_mut(id) {
                ours.value += theirs.value - theirs.init;
            }
        }
    }
}
