//! Foundational types for the coffer document store.
//!
//! This crate carries the pieces every other coffer crate depends on and
//! that depend on nothing themselves: the typed [`Error`] shared across the
//! workspace, the big-endian [`codec`] used by every cryptographic binding,
//! the [`canon`] context encoding that becomes the AAD of every ciphertext
//! and the message of every MAC, and small [`base64`] helpers.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod base64;
pub mod canon;
pub mod codec;
mod error;

pub use self::error::{Error, Kind, Result};
