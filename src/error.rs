//! Unified error taxonomy.
//!
//! Every failure class is distinguishable by variant, not by message:
//! callers route on the type (retry network errors, refetch on conflict,
//! surface integrity failures immediately).

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Server error body: `{code, detail}` (msgpack).
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// AEAD tag or chunk MAC mismatch, or a padding sentinel is missing.
    /// Raised locally; never retried.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A chunk is listed but its ciphertext bytes are absent (light
    /// listings). Caller should download the content and retry.
    #[error("missing content: {0}")]
    MissingContent(String),

    /// HTTP 401. `code` carries the server reason (`login_bad_signature`,
    /// `user_not_init`, `token_expired`) for policy routing.
    #[error("unauthorized ({code}): {detail}")]
    Unauthorized { code: String, detail: String },

    /// HTTP 403.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 409, or a stale `etag`/`stoken` aborting a batch/transaction.
    #[error("conflict: {0}")]
    Conflict(String),

    /// HTTP 502/503/504. Safe to retry with backoff.
    #[error("temporary server error ({status}): {detail}")]
    TemporaryServer { status: u16, detail: String },

    /// Any other 5xx. Surfaced, not auto-retried.
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },

    /// Transport failure before any HTTP status was received.
    #[error("network error: {0}")]
    Network(String),

    /// Invariant violation attributable to the caller, e.g. submitting an
    /// item to the wrong collection's item manager.
    #[error("programming error: {0}")]
    Programming(String),

    /// Entity version newer than this client understands.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Local serialization failure (msgpack, base64, url).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Local filesystem failure (cache layer only).
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    pub(crate) fn integrity(what: impl fmt::Display) -> Self {
        Error::Integrity(what.to_string())
    }

    pub(crate) fn programming(what: impl fmt::Display) -> Self {
        Error::Programming(what.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encoding(format!("msgpack encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Encoding(format!("msgpack decode: {e}"))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Encoding(format!("base64: {e}"))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Encoding(format!("url: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
