//! Crate-wide error type.
//!
//! The variants follow how the coordinator reacts to a failure, not where it
//! came from: daemon outages are retryable and never blamed on a worker,
//! rejections are recorded, persistence conflicts are retried by the caller
//! and configuration errors stop the process at startup.

use crate::daemon::DaemonError;

/// Coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Daemon unreachable or timed out. Retryable.
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Daemon answered with an explicit refusal.
    #[error("daemon rejected request: {0}")]
    DaemonRejected(String),

    /// No registered worker for this address.
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    /// A unique key was already taken. Retry or reconcile, never drop.
    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    /// Writing the committed state failed; the transaction was rolled back.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DaemonUnavailable(_) | Error::PersistenceConflict(_) | Error::Persistence(_)
        )
    }
}

impl From<DaemonError> for Error {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Unavailable(msg) => Error::DaemonUnavailable(msg),
            DaemonError::Rejected { code, message } => {
                Error::DaemonRejected(format!("{message} (code {code})"))
            }
            // A malformed reply is the daemon's fault, not the worker's.
            DaemonError::Protocol(msg) => Error::DaemonUnavailable(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_errors_map_onto_taxonomy() {
        let err: Error = DaemonError::Unavailable("timed out".into()).into();
        assert!(matches!(err, Error::DaemonUnavailable(_)));
        assert!(err.is_retryable());

        let err: Error = DaemonError::Rejected {
            code: -5,
            message: "Invalid address".into(),
        }
        .into();
        assert!(matches!(err, Error::DaemonRejected(_)));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "daemon rejected request: Invalid address (code -5)"
        );

        let err: Error = DaemonError::Protocol("missing result".into()).into();
        assert!(matches!(err, Error::DaemonUnavailable(_)));
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = Error::ConfigurationInvalid("payout threshold must be positive".into());
        assert!(!err.is_retryable());
    }
}
