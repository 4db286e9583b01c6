//! Error types at the two boundaries of the proxy: the remote store, and the
//! process itself.

use thiserror::Error;

/// Classification of a remote-store call outcome, as required by the
/// breaker and the router's response policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote store reports the object does not exist. Counts as
    /// success against the circuit breaker: the network worked.
    #[error("object not found")]
    NotFound,

    /// The remote credentials were rejected or have expired. Fatal: the
    /// process exits rather than retry, relying on a supervisor to
    /// respawn it with fresh credentials.
    #[error("credentials expired or rejected: {0}")]
    CredentialExpiry(String),

    /// Any other remote error. `retryable` reflects whether the SDK
    /// flagged the underlying failure as transient; `status` carries the
    /// remote's HTTP status when one was available.
    #[error("remote store error ({status:?}): {message}")]
    Other {
        status: Option<u16>,
        retryable: bool,
        message: String,
    },
}

impl StoreError {
    /// Whether this error should count toward the circuit breaker, per
    /// the error-kind table in the design: only `NotFound` and
    /// `CredentialExpiry` are excluded.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(self, StoreError::NotFound | StoreError::CredentialExpiry(_))
    }

    /// Whether `allowOffline` downgrading applies to this error.
    pub fn is_offline_downgradable(&self) -> bool {
        matches!(self, StoreError::Other { retryable: true, .. })
    }

    /// The HTTP status to report to the client when `allowOffline` is not
    /// set and this isn't a `NotFound`/`CredentialExpiry` case.
    pub fn fallback_status(&self) -> u16 {
        match self {
            StoreError::Other { status: Some(s), .. } => *s,
            _ => 404,
        }
    }
}

/// Errors that can abort process startup or force an unrecoverable exit.
/// Distinct from [`StoreError`]: this never reaches `RequestRouter`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spool directory error: {0}")]
    Spool(#[from] std::io::Error),

    #[error("server loop exited: {0}")]
    Serve(String),
}
