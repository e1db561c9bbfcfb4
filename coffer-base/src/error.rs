//! The error type shared by the coffer workspace.

use std::fmt;

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the coffer core and its plumbing.
///
/// Every variant carries a plain-text detail string so the error stays
/// [`Clone`]: a single failure may have to be delivered to many pending
/// operation futures at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Access was denied, typically because the password is wrong.
    #[error("access denied: {0}")]
    Access(String),
    /// A MAC did not verify.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// The configuration blob is malformed or unsupported.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An optimistic write lost the race against another writer.
    #[error("storage conflict: {0}")]
    Conflict(String),
    /// Stored data is malformed.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// A usage counter is missing or inconsistent.
    #[error("counter state: {0}")]
    Counter(String),
    /// A ciphertext failed to decrypt, usually an AAD or key mismatch.
    #[error("decryption failed: {0}")]
    Decrypt(String),
    /// The target already exists.
    #[error("already exists: {0}")]
    Exists(String),
    /// Key material could not be interpreted.
    #[error("malformed key material: {0}")]
    ParseKey(String),
    /// A ciphertext names a key sequence number that is not present.
    #[error("unknown key: {0}")]
    MissingKey(String),
    /// The target does not exist.
    #[error("not found: {0}")]
    Missing(String),
    /// A document path failed to parse.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// A scheduling constraint was violated, e.g. an unknown dependency.
    #[error("scheduling error: {0}")]
    Schedule(String),
    /// The storage adapter failed.
    #[error("storage i/o: {0}")]
    Io(String),
}

/// The kind of an [`Error`], for matching without the detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Kind {
    Access,
    AuthFailed,
    Config,
    Conflict,
    Corrupt,
    Counter,
    Decrypt,
    Exists,
    ParseKey,
    MissingKey,
    Missing,
    InvalidPath,
    Schedule,
    Io,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Access(_) => Kind::Access,
            Error::AuthFailed(_) => Kind::AuthFailed,
            Error::Config(_) => Kind::Config,
            Error::Conflict(_) => Kind::Conflict,
            Error::Corrupt(_) => Kind::Corrupt,
            Error::Counter(_) => Kind::Counter,
            Error::Decrypt(_) => Kind::Decrypt,
            Error::Exists(_) => Kind::Exists,
            Error::ParseKey(_) => Kind::ParseKey,
            Error::MissingKey(_) => Kind::MissingKey,
            Error::Missing(_) => Kind::Missing,
            Error::InvalidPath(_) => Kind::InvalidPath,
            Error::Schedule(_) => Kind::Schedule,
            Error::Io(_) => Kind::Io,
        }
    }

    /// Whether a caller is expected to re-plan and retry.
    ///
    /// Conflicts and scheduling races are transient; everything else is
    /// surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), Kind::Conflict | Kind::Schedule)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
