//! Shared error taxonomy.
//!
//! Every backend adapter normalizes its native failures into [`Error`] at
//! the operation boundary.  Callers only ever need to distinguish a handful
//! of conditions (`NotFound`, `Canceled`, an invalid pattern, a finalized
//! writer); anything else is carried through as [`Error::Opaque`] so the
//! backend detail stays inspectable.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by bucket operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested object does not exist.
    #[error("bucketfs: object not found")]
    NotFound,

    /// The operation was aborted by a cancellation or an elapsed deadline.
    #[error("bucketfs: operation canceled")]
    Canceled,

    /// A glob pattern failed to compile.  Raised by `glob` before any
    /// backend call is made.
    #[error("bucketfs: invalid glob pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// `commit` or `discard` was called on a writer that already finalized.
    #[error("bucketfs: writer already finalized")]
    AlreadyFinalized,

    /// The object name collapses to the namespace root.
    #[error("bucketfs: invalid object name {0:?}")]
    InvalidName(String),

    /// No resolver is registered for the URL scheme.
    #[error("bucketfs: unknown URL scheme {0:?}")]
    UnknownScheme(String),

    /// The bucket configuration is unusable.
    #[error("bucketfs: invalid configuration: {0}")]
    Config(String),

    /// Unmapped backend failure, passed through unchanged.
    #[error(transparent)]
    Opaque(#[from] anyhow::Error),
}

impl Error {
    /// Short machine-friendly code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => "not_found",
            Error::Canceled => "canceled",
            Error::InvalidPattern { .. } => "invalid_pattern",
            Error::AlreadyFinalized => "already_finalized",
            Error::InvalidName(_) => "invalid_name",
            Error::UnknownScheme(_) => "unknown_scheme",
            Error::Config(_) => "config",
            Error::Opaque(_) => "opaque",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Wrap an arbitrary backend error as [`Error::Opaque`] with context.
    pub fn opaque(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Opaque(anyhow::anyhow!("{context}: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        normalize_io(err)
    }
}

/// Map an I/O error into the taxonomy by its kind.
pub fn normalize_io(err: std::io::Error) -> Error {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => Error::NotFound,
        ErrorKind::TimedOut | ErrorKind::Interrupted => Error::Canceled,
        _ => {
            // A nested bucketfs error may travel inside an io::Error when it
            // crossed an AsyncRead boundary.
            if err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<Error>())
                .is_some()
            {
                if let Some(inner) = err.into_inner() {
                    if let Ok(inner) = inner.downcast::<Error>() {
                        return *inner;
                    }
                }
                return Error::Opaque(anyhow::anyhow!("unrecoverable nested I/O error"));
            }
            Error::Opaque(anyhow::Error::new(err))
        }
    }
}

/// Map a `reqwest` transport error into the taxonomy.
pub fn normalize_http(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Canceled;
    }
    if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
        return Error::NotFound;
    }
    Error::opaque(context, err)
}

/// Run `fut` under a deadline, reporting an elapsed deadline as
/// [`Error::Canceled`].
///
/// Dropping the inner future is the cancellation signal: writers release
/// their staging file and iterators stop fetching.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Canceled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, ErrorKind};

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: Error = io::Error::new(ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_timeout_maps_to_canceled() {
        let err: Error = io::Error::new(ErrorKind::TimedOut, "slow").into();
        assert!(err.is_canceled());
    }

    #[test]
    fn test_io_other_is_opaque_and_keeps_detail() {
        let err: Error = io::Error::new(ErrorKind::PermissionDenied, "nope").into();
        match err {
            Error::Opaque(inner) => {
                let io_err = inner.downcast_ref::<io::Error>().unwrap();
                assert_eq!(io_err.kind(), ErrorKind::PermissionDenied);
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_error_is_unwrapped() {
        let io_err = io::Error::new(ErrorKind::Other, Error::AlreadyFinalized);
        assert!(matches!(normalize_io(io_err), Error::AlreadyFinalized));
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            Error::NotFound.code(),
            Error::Canceled.code(),
            Error::AlreadyFinalized.code(),
            Error::InvalidName(String::new()).code(),
            Error::UnknownScheme(String::new()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[tokio::test]
    async fn test_with_deadline_elapsed_is_canceled() {
        let res: Result<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(res.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let res = with_deadline(Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
