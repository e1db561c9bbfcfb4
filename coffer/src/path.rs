//! Document paths.
//!
//! Paths are absolute, `/`-separated, and NFC-normalised at parse time so
//! that shard indexes sort consistently no matter how a caller composed the
//! string.

use std::fmt;
use std::str::FromStr;

use unicode_normalization::UnicodeNormalization;

use coffer_base::{Error, Result};

/// A parsed, normalised document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    raw: String,
}

impl DocPath {
    /// Parse and normalise a path.
    ///
    /// Paths must be absolute; empty segments, `.`/`..`, and control
    /// characters fail `InvalidPath`.
    pub fn parse(input: &str) -> Result<Self> {
        let Some(rest) = input.strip_prefix('/') else {
            return Err(Error::InvalidPath(format!("not absolute: {input}")));
        };
        if rest.is_empty() {
            return Ok(Self { raw: "/".to_string() });
        }
        let mut raw = String::with_capacity(input.len());
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidPath(format!("empty segment in {input}")));
            }
            if segment == "." || segment == ".." {
                return Err(Error::InvalidPath(format!("relative segment in {input}")));
            }
            if segment.chars().any(char::is_control) {
                return Err(Error::InvalidPath(format!("control character in {input}")));
            }
            raw.push('/');
            raw.extend(segment.nfc());
        }
        Ok(Self { raw })
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self { raw: "/".to_string() }
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.raw == "/"
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The path segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('/').filter(|s| !s.is_empty())
    }

    /// The final segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.raw.rsplit('/').next()
        }
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<DocPath> {
        if self.is_root() {
            return None;
        }
        match self.raw.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(at) => Some(Self {
                raw: self.raw[..at].to_string(),
            }),
            None => None,
        }
    }

    /// A child of this path.
    pub fn join(&self, name: &str) -> Result<DocPath> {
        if self.is_root() {
            Self::parse(&format!("/{name}"))
        } else {
            Self::parse(&format!("{}/{name}", self.raw))
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for DocPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
