//! Encrypted value containers.
//!
//! A [`Cell`] wraps one JSON-serialisable value and the [`Context`] it is
//! bound to. The context becomes the cipher AAD, so a cell's bytes only ever
//! decrypt at the exact location they were written for: move an item to
//! another path, another scope, or another shard and [`Cell::get`] fails.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use coffer_base::canon::Context;
use coffer_base::{Error, Result};

use crate::crypto::Cipher;

/// An encrypted container for a single value of type `T`.
///
/// Plaintext is decoded lazily on first [`get`](Cell::get) and cached;
/// [`serialize`](Cell::serialize) re-encrypts only if the value was modified
/// since load, otherwise it reproduces the stored bytes exactly. That
/// idempotence is what keeps shard serialisation deterministic when only a
/// subset of items changed.
pub struct Cell<T> {
    cipher: Arc<dyn Cipher>,
    context: Context,
    ciphertext: Option<Bytes>,
    plaintext: Option<T>,
    loaded: bool,
    modified: bool,
}

impl<T> Cell<T> {
    /// A new empty cell bound to `context`.
    pub fn new(cipher: Arc<dyn Cipher>, context: Context) -> Self {
        Self {
            cipher,
            context,
            ciphertext: None,
            plaintext: None,
            loaded: true,
            modified: false,
        }
    }

    /// Wrap stored ciphertext bound to `context`.
    pub fn from_ciphertext(cipher: Arc<dyn Cipher>, context: Context, data: Vec<u8>) -> Self {
        Self {
            cipher,
            context,
            ciphertext: Some(Bytes::from(data)),
            plaintext: None,
            loaded: false,
            modified: false,
        }
    }

    /// The binding context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Whether the cell holds neither ciphertext nor plaintext.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_none() && self.plaintext.is_none()
    }

    /// Whether the value changed since load.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// The cached plaintext, without decrypting.
    ///
    /// `None` both for an empty cell and for one that was never decrypted.
    pub fn cached(&self) -> Option<&T> {
        self.plaintext.as_ref()
    }
}

impl<T> Cell<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// The decrypted value, or `None` for an empty cell.
    ///
    /// The first call decrypts and caches; later calls are free. Fails
    /// `Decrypt` when the key or context does not match the stored bytes.
    pub fn get(&mut self) -> Result<Option<&T>> {
        if !self.loaded {
            let data = self.ciphertext.as_ref().expect("unloaded cell has ciphertext");
            let plain = self.cipher.decrypt(data, &self.context)?;
            let value: T = serde_json::from_slice(&plain)
                .map_err(|err| Error::Corrupt(format!("cell value: {err}")))?;
            self.plaintext = Some(value);
            self.loaded = true;
        }
        Ok(self.plaintext.as_ref())
    }

    /// Store a new value and mark the cell modified.
    ///
    /// No encryption happens until [`serialize`](Cell::serialize).
    pub fn set(&mut self, value: T) {
        self.plaintext = Some(value);
        self.loaded = true;
        self.modified = true;
    }

    /// Replace the value with `f(current)`.
    ///
    /// The current value is left untouched when `f` fails.
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Option<T>) -> Result<T>,
    {
        self.get()?;
        let current = self.plaintext.clone();
        let next = f(current)?;
        self.set(next);
        Ok(())
    }

    /// The encrypted form of the cell.
    ///
    /// A modified cell is re-encrypted with a fresh IV and the result cached;
    /// an unmodified cell returns the exact bytes it was constructed with.
    /// Fails `Corrupt` on an empty cell.
    pub fn serialize(&mut self) -> Result<Bytes> {
        if self.modified {
            let value = self
                .plaintext
                .as_ref()
                .ok_or_else(|| Error::Corrupt("serializing empty cell".into()))?;
            let plain = serde_json::to_vec(value)
                .map_err(|err| Error::Corrupt(format!("cell value: {err}")))?;
            let sealed = self.cipher.encrypt(&plain, &self.context)?;
            self.ciphertext = Some(Bytes::from(sealed));
            self.modified = false;
        }
        self.ciphertext
            .clone()
            .ok_or_else(|| Error::Corrupt("serializing empty cell".into()))
    }
}

// Cells appear inside shard state dumps; the value itself stays opaque.
impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("context", &self.context)
            .field("stored", &self.ciphertext.is_some())
            .field("loaded", &self.loaded)
            .field("modified", &self.modified)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value as Json};

    use crate::crypto::AeadCipher;

    use super::*;

    fn cipher() -> Arc<dyn Cipher> {
        Arc::new(AeadCipher::generate())
    }

    #[test]
    fn set_get_round_trip() {
        let mut cell: Cell<Json> = Cell::new(cipher(), Context::new().with("scope", "items"));
        assert!(cell.get().unwrap().is_none());
        cell.set(json!({"answer": 42}));
        assert_eq!(cell.get().unwrap(), Some(&json!({"answer": 42})));
    }

    #[test]
    fn serialize_round_trips_through_ciphertext() {
        let cipher = cipher();
        let ctx = Context::new().with("file", "s").with("scope", "items");
        let mut cell: Cell<Json> = Cell::new(cipher.clone(), ctx.clone());
        cell.set(json!(["a", "b"]));
        let bytes = cell.serialize().unwrap();

        let mut parsed: Cell<Json> = Cell::from_ciphertext(cipher, ctx, bytes.to_vec());
        assert_eq!(parsed.get().unwrap(), Some(&json!(["a", "b"])));
    }

    #[test]
    fn unmodified_serialize_is_idempotent() {
        let cipher = cipher();
        let ctx = Context::new().with("scope", "index");
        let mut cell: Cell<Vec<String>> = Cell::new(cipher.clone(), ctx.clone());
        cell.set(vec!["x".into()]);
        let first = cell.serialize().unwrap();
        assert_eq!(cell.serialize().unwrap(), first);

        let mut reparsed: Cell<Vec<String>> =
            Cell::from_ciphertext(cipher, ctx, first.to_vec());
        reparsed.get().unwrap();
        // Decryption alone does not dirty the cell.
        assert_eq!(reparsed.serialize().unwrap(), first);
    }

    #[test]
    fn modified_serialize_produces_fresh_bytes() {
        let mut cell: Cell<Json> = Cell::new(cipher(), Context::new());
        cell.set(json!(1));
        let first = cell.serialize().unwrap();
        cell.set(json!(1));
        let second = cell.serialize().unwrap();
        // Same value, new IV.
        assert_ne!(first, second);
    }

    #[test]
    fn context_mismatch_fails_get() {
        let cipher = cipher();
        let ctx = Context::new().with("path", "/a").with("file", "s");
        let mut cell: Cell<Json> = Cell::new(cipher.clone(), ctx.clone());
        cell.set(json!("doc"));
        let bytes = cell.serialize().unwrap().to_vec();

        for bad in [
            Context::new().with("path", "/b").with("file", "s"),
            Context::new().with("path", "/a"),
            ctx.clone().with("extra", "field"),
        ] {
            let mut broken: Cell<Json> = Cell::from_ciphertext(cipher.clone(), bad, bytes.clone());
            assert!(matches!(broken.get(), Err(Error::Decrypt(_))));
        }
    }

    #[test]
    fn empty_cell_serialize_is_corrupt() {
        let mut cell: Cell<Json> = Cell::new(cipher(), Context::new());
        assert!(matches!(cell.serialize(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn failed_update_leaves_value_intact() {
        let mut cell: Cell<Json> = Cell::new(cipher(), Context::new());
        cell.set(json!(1));
        let err = cell.update(|_| Err(Error::Missing("nope".into())));
        assert!(err.is_err());
        assert_eq!(cell.get().unwrap(), Some(&json!(1)));
    }
}
