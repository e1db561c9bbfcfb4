//! Per-shard key rings with usage-limited rollover.
//!
//! A [`KeyRing`] owns an ordered sequence of AEAD keys. Every encryption is
//! charged against the newest key's message and block counters; when either
//! limit would be exceeded a fresh key is appended under the next sequence
//! number. Ciphertexts carry their sequence number in clear so old data
//! stays readable forever, and the set of sequence numbers plus the counter
//! state is signed so that no key or counter can be silently altered,
//! reordered, or dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use coffer_base::canon::Context;
use coffer_base::codec::{self, Atom, Value};
use coffer_base::{base64, Error, Result};

use crate::cell::Cell;
use crate::counters::Counters;
use crate::crypto::{AeadCipher, Cipher, Verifier, KEY_LEN};

/// Algorithm identifier stored with every key.
pub const ALGO_AES256GCM: &str = "A256GCM";

/// Usage limits for a single key.
///
/// The defaults keep AES-256-GCM comfortably inside its safety margins:
/// fewer than 2^31 messages and fewer than 2^47 cipher blocks per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum messages encrypted under one key.
    pub msg: u64,
    /// Maximum cipher blocks consumed by one key.
    pub blk: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            msg: (1 << 31) - 1,
            blk: (1 << 47) - 1,
        }
    }
}

/// Blocks consumed encrypting `nbytes`, counting the GCM counter block.
fn blocks(nbytes: usize) -> u64 {
    1 + (8 * nbytes as u64).div_ceil(128)
}

fn msg_id(seq: u32) -> String {
    format!("{seq}.msg")
}

fn blk_id(seq: u32) -> String {
    format!("{seq}.blk")
}

/// Key material as stored inside a key cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyMaterial {
    algo: String,
    #[serde(with = "base64::serde")]
    key: Vec<u8>,
}

struct KeyEntry {
    seq: u32,
    cell: Cell<KeyMaterial>,
    /// Built on first use from the decrypted key material.
    cipher: Option<Arc<AeadCipher>>,
}

struct State {
    keys: Vec<KeyEntry>,
    counters: Counters,
}

/// The serialised form of a key ring, embedded in the shard header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRingConfig {
    /// One base64 entry per key: `u32 seq || encrypted key cell`.
    pub keys: Vec<String>,
    /// Base64 of the big-endian `u64` counter values, msg then blk per key.
    pub state: String,
    /// Base64 HMAC over the binding context extended with seqs and state.
    pub mac: String,
}

/// An ordered ring of AEAD keys with usage-limit rollover.
pub struct KeyRing {
    context: Context,
    parent: Arc<dyn Cipher>,
    verifier: Verifier,
    limits: Limits,
    state: Mutex<State>,
}

impl KeyRing {
    /// A fresh ring with no keys; the first encryption creates sequence 1.
    ///
    /// `context` is the shard binding (typically `{file: <shard id>}`);
    /// key cells are encrypted under `parent` with `key: <seq>` appended.
    pub fn new(
        parent: Arc<dyn Cipher>,
        verifier: Verifier,
        context: Context,
        limits: Limits,
    ) -> Self {
        Self {
            context,
            parent,
            verifier,
            limits,
            state: Mutex::new(State {
                keys: Vec::new(),
                counters: Counters::new(),
            }),
        }
    }

    /// Restore a ring from its serialised form.
    ///
    /// The MAC is verified before any field is trusted: altered sequence
    /// numbers, reordered keys, or modified counter state all fail
    /// `AuthFailed` here. Restored counter values double as their committed
    /// baselines.
    pub fn parse(
        config: &KeyRingConfig,
        parent: Arc<dyn Cipher>,
        verifier: Verifier,
        context: Context,
        limits: Limits,
    ) -> Result<Self> {
        let mut seqs = Vec::with_capacity(config.keys.len());
        let mut cells = Vec::with_capacity(config.keys.len());
        for entry in &config.keys {
            let packed = base64::parse_vec(entry)?;
            let mut values = codec::decode(&[Atom::U32, Atom::Bytes], &packed)?.into_iter();
            let seq = values.next().expect("decoded pattern").as_int()? as u32;
            let data = values.next().expect("decoded pattern").into_bytes()?;
            seqs.push(seq);
            cells.push(data);
        }
        let state_bytes = base64::parse_vec(&config.state)?;
        let mac = base64::parse_vec(&config.mac)?;

        let message = context
            .clone()
            .with("keys", codec::encode_array(&seqs))
            .with("state", state_bytes.clone())
            .encode();
        verifier.verify(&message, &mac)?;

        if seqs.windows(2).any(|w| w[0] >= w[1]) || seqs.first().is_some_and(|s| *s == 0) {
            return Err(Error::Corrupt("key sequence not strictly increasing".into()));
        }
        let values: Vec<u64> = codec::decode_array(&state_bytes)?;
        if values.len() != 2 * seqs.len() {
            return Err(Error::Corrupt(format!(
                "{} counter values for {} keys",
                values.len(),
                seqs.len()
            )));
        }

        let mut counters = Counters::new();
        let mut keys = Vec::with_capacity(seqs.len());
        for (i, (seq, data)) in seqs.into_iter().zip(cells).enumerate() {
            counters.restore(&msg_id(seq), values[2 * i])?;
            counters.restore(&blk_id(seq), values[2 * i + 1])?;
            let cell = Cell::from_ciphertext(
                parent.clone(),
                context.clone().with("key", seq),
                data,
            );
            keys.push(KeyEntry {
                seq,
                cell,
                cipher: None,
            });
        }
        Ok(Self {
            context,
            parent,
            verifier,
            limits,
            state: Mutex::new(State { keys, counters }),
        })
    }

    /// Serialise the ring for embedding in a shard header.
    pub fn serialize(&self) -> Result<KeyRingConfig> {
        let mut state = self.state.lock();
        let mut keys = Vec::with_capacity(state.keys.len());
        let mut seqs = Vec::with_capacity(state.keys.len());
        let mut values = Vec::with_capacity(2 * state.keys.len());
        for entry in &mut state.keys {
            let data = entry.cell.serialize()?;
            let packed = codec::encode(
                &[Atom::U32, Atom::Bytes],
                &[Value::Int(entry.seq as u64), Value::Bytes(data.to_vec())],
            )?;
            keys.push(base64::fmt(&packed));
            seqs.push(entry.seq);
        }
        for seq in &seqs {
            for id in [msg_id(*seq), blk_id(*seq)] {
                let value = state
                    .counters
                    .get(&id)
                    .ok_or_else(|| Error::Counter(format!("missing counter {id}")))?;
                values.push(value);
            }
        }
        let state_bytes = codec::encode_array(&values);
        let message = self
            .context
            .clone()
            .with("keys", codec::encode_array(&seqs))
            .with("state", state_bytes.clone())
            .encode();
        let mac = self.verifier.sign(&message);
        Ok(KeyRingConfig {
            keys,
            state: base64::fmt(&state_bytes),
            mac: base64::fmt(mac),
        })
    }

    /// Number of keys in the ring.
    pub fn size(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Snapshot of the counter bag.
    pub fn counters(&self) -> Counters {
        self.state.lock().counters.clone()
    }

    /// Fold retained counters from a conflicted write into this ring.
    pub fn merge_counters(&self, other: &Counters) {
        self.state.lock().counters.merge(other);
    }

    /// Mark the current counter values as committed.
    pub fn commit_counters(&self) {
        self.state.lock().counters.commit();
    }

    fn append_key(&self, state: &mut State) -> Result<u32> {
        let seq = state.keys.last().map(|e| e.seq + 1).unwrap_or(1);
        let key: [u8; KEY_LEN] = crate::crypto::random_bytes();
        let mut cell = Cell::new(
            self.parent.clone(),
            self.context.clone().with("key", seq),
        );
        cell.set(KeyMaterial {
            algo: ALGO_AES256GCM.to_string(),
            key: key.to_vec(),
        });
        state.counters.insert(&msg_id(seq))?;
        state.counters.insert(&blk_id(seq))?;
        state.keys.push(KeyEntry {
            seq,
            cell,
            cipher: Some(Arc::new(AeadCipher::new(key))),
        });
        tracing::debug!(seq, "appended key");
        Ok(seq)
    }

    fn cipher_for(entry: &mut KeyEntry) -> Result<Arc<AeadCipher>> {
        if let Some(cipher) = &entry.cipher {
            return Ok(cipher.clone());
        }
        let seq = entry.seq;
        let material = entry
            .cell
            .get()
            .map_err(|err| match err {
                Error::Decrypt(_) => Error::AuthFailed(format!("key cell {seq}")),
                other => other,
            })?
            .ok_or_else(|| Error::ParseKey(format!("empty key cell {seq}")))?;
        if material.algo != ALGO_AES256GCM {
            return Err(Error::ParseKey(format!(
                "unsupported algorithm {}",
                material.algo
            )));
        }
        let key: [u8; KEY_LEN] = material
            .key
            .clone()
            .try_into()
            .map_err(|_| Error::ParseKey(format!("bad key length for {seq}")))?;
        let cipher = Arc::new(AeadCipher::new(key));
        entry.cipher = Some(cipher.clone());
        Ok(cipher)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("context", &self.context)
            .field("size", &self.size())
            .finish()
    }
}

impl Cipher for KeyRing {
    fn encrypt(&self, plaintext: &[u8], context: &Context) -> Result<Vec<u8>> {
        // Key selection and counter charge are one atomic step.
        let mut state = self.state.lock();
        let nblocks = blocks(plaintext.len());
        let reusable = state.keys.last().map(|e| e.seq).filter(|seq| {
            state.counters.get(&msg_id(*seq)).unwrap_or(0) + 1 <= self.limits.msg
                && state.counters.get(&blk_id(*seq)).unwrap_or(0) + nblocks <= self.limits.blk
        });
        let seq = match reusable {
            Some(seq) => seq,
            None => self.append_key(&mut state)?,
        };
        state.counters.add(&msg_id(seq), 1)?;
        state.counters.add(&blk_id(seq), nblocks)?;
        let entry = state
            .keys
            .iter_mut()
            .find(|e| e.seq == seq)
            .expect("selected key exists");
        let cipher = Self::cipher_for(entry)?;
        let sealed = cipher.encrypt(plaintext, &context.clone().with("key", seq))?;
        codec::encode(
            &[Atom::U32, Atom::Bytes],
            &[Value::Int(seq as u64), Value::Bytes(sealed)],
        )
    }

    fn decrypt(&self, ciphertext: &[u8], context: &Context) -> Result<Vec<u8>> {
        let mut values = codec::decode(&[Atom::U32, Atom::Bytes], ciphertext)?.into_iter();
        let seq = values.next().expect("decoded pattern").as_int()? as u32;
        let sealed = values.next().expect("decoded pattern").into_bytes()?;
        let mut state = self.state.lock();
        let entry = state
            .keys
            .iter_mut()
            .find(|e| e.seq == seq)
            .ok_or_else(|| Error::MissingKey(format!("sequence {seq}")))?;
        let cipher = Self::cipher_for(entry)?;
        cipher.decrypt(&sealed, &context.clone().with("key", seq))
    }
}
