//! The storage adapter contract.
//!
//! A [`Store`] keeps opaque text blobs by id and guards every write with an
//! optimistic revision check. Revisions are content hashes; the cache above
//! never interprets them, only hands them back.

use std::fmt;

use async_trait::async_trait;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

use coffer_base::Result;

pub mod fs;
pub mod mem;

/// A stored blob with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    /// The blob contents.
    pub value: String,
    /// Opaque revision of the stored contents.
    pub rev: String,
}

/// Byte-blob storage with compare-and-swap writes.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Read the blob at `id`, or `None` when absent.
    async fn read(&self, id: &str) -> Result<Option<Stored>>;

    /// Write `value` at `id` if the current revision equals `rev`.
    ///
    /// `rev = None` asserts that the blob must not exist yet. A mismatch
    /// fails `Conflict`; success returns the new revision.
    async fn write(&self, id: &str, value: &str, rev: Option<&str>) -> Result<String>;
}

/// The revision of a blob: lowercase hex of its SHA-256.
pub(crate) fn rev_of(value: &str) -> String {
    HEXLOWER.encode(&Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_track_content() {
        assert_eq!(rev_of("blob"), rev_of("blob"));
        assert_ne!(rev_of("blob"), rev_of("blob2"));
    }
}
