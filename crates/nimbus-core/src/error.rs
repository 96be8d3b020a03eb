//! Error taxonomy for the sharing engine.
//!
//! One enum covers every layer so errors can cross the store, VFS, and
//! replication seams without translation. The replicator relies on
//! [`Error::is_retryable`] to decide between backoff and giving up.

use thiserror::Error;

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The sharing document is malformed (no rules, bad members, ...).
    #[error("invalid sharing")]
    InvalidSharing,

    /// A member instance address could not be parsed.
    #[error("invalid instance URL: {0}")]
    InvalidUrl(String),

    /// No usable OAuth credentials for this member.
    #[error("no OAuth client for this member")]
    NoOAuthClient,

    /// Attempt to sync a document outside every sharing rule. Never retried.
    #[error("document outside the sharing rules: {0}")]
    Safety(String),

    /// Local write contention (revision changed underneath us).
    #[error("conflict: {0}")]
    Conflict(String),

    /// 4xx from the peer. One retry after refreshing the access token.
    #[error("peer returned {status}: {message}")]
    ClientError { status: u16, message: String },

    /// 5xx from the peer. Retried with backoff.
    #[error("peer returned {status}: {message}")]
    InternalServerError { status: u16, message: String },

    /// A named lock could not be acquired within the wait budget.
    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("not found: {0}")]
    NotFound(String),

    /// MD5 of the received bytes does not match the announced digest.
    #[error("invalid content hash")]
    InvalidHash,

    #[error("content length mismatch (expected {expected}, got {actual})")]
    ContentLengthMismatch { expected: u64, actual: u64 },

    #[error("file exceeds the maximum allowed size")]
    FileTooBig,

    /// A revision string did not parse as `<generation>-<hash>`.
    #[error("malformed revision: {0}")]
    MalformedRevision(String),

    /// A file or directory already exists at the target path.
    #[error("path already exists: {0}")]
    PathExists(String),

    /// Document store failure outside the taxonomy above.
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Aggregate of per-document failures from a replication batch.
    #[error("{} errors: [{}]", .0.len(), format_multi(.0))]
    Multi(Vec<Error>),
}

fn format_multi(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Collapse a list of errors: empty is ok, one error stays itself.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Multi(errors)),
        }
    }

    /// Whether the replicator should back off and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InternalServerError { .. } | Error::Conflict(_) | Error::Io(_) => true,
            Error::Multi(errors) => errors.iter().any(Error::is_retryable),
            _ => false,
        }
    }

    /// Whether a token refresh plus a single retry may help.
    pub fn is_auth_retryable(&self) -> bool {
        matches!(self, Error::ClientError { status, .. } if *status == 401 || *status == 403)
    }
}
