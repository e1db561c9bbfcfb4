//! An encrypted, sharded, hierarchical document store.
//!
//! Documents are JSON values addressed by absolute paths. They are
//! partitioned across a fixed set of [shards](shard::Shard) — encrypted
//! ordered maps serialised to opaque text blobs — over a pluggable
//! [storage adapter](store::Store) with optimistic compare-and-swap writes.
//! Everything at rest is encrypted under a password-derived key hierarchy:
//! a [config](config) blob holds the master keys, each shard rotates its
//! own [key ring](keyring::KeyRing) at usage limits, and every stored cell
//! is bound to its location through the AAD of its [cell](cell::Cell).
//!
//! Concurrent multi-shard work is serialised by a dependency-aware
//! [schedule](schedule::Schedule) of per-shard operation groups, drained by
//! an [executor](executor::Executor) that loads shards coherently, applies
//! each group as one read-apply-write transaction, and propagates partial
//! failure to exactly the operations it cancels. The [`Docs`] API on top
//! plans path-level reads, writes, and directory maintenance, and retries
//! transient conflicts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! # async fn demo() -> coffer::Result<()> {
//! let store = Arc::new(coffer::store::mem::MemStore::new());
//! let docs = coffer::Docs::open(store, "correct horse").await?;
//! docs.update("/notes/today", |_| Ok(json!({"todo": "ship"}))).await?;
//! assert!(docs.get("/notes/today").await?.is_some());
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod cell;
pub mod config;
pub mod counters;
pub mod crypto;
pub mod docs;
pub mod executor;
pub mod keyring;
pub mod path;
pub mod schedule;
pub mod shard;
pub mod store;

pub use coffer_base::{canon, Error, Kind, Result};

pub use self::docs::Docs;
pub use self::path::DocPath;
