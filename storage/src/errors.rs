use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

/// Errors surfaced while resolving, connecting to or retrieving from a
/// storage.
///
/// The payloads are plain strings, so the same error can be handed to every
/// caller waiting on a shared retrieval.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("no storage handler found for locator {0:?}")]
    UnresolvedLocator(String),

    #[error("storage type {0:?} is not supported")]
    UnknownStorageType(String),

    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cache entry {id} is registered at {existing:?}, refusing to re-register it at {new:?}")]
    CacheConsistency {
        id: String,
        existing: PathBuf,
        new: PathBuf,
    },
}

impl Error {
    /// Whether the caller may reasonably try the same operation again.
    /// Nothing inside this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(value.to_string()),
            std::io::ErrorKind::TimedOut => Error::Timeout(value.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => Error::Connection(value.to_string()),
            _ => Error::Io(value.to_string()),
        }
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(value: zip::result::ZipError) -> Self {
        match value {
            zip::result::ZipError::FileNotFound => Error::NotFound(value.to_string()),
            zip::result::ZipError::Io(e) => e.into(),
            e => Error::Io(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        // urls may carry credentials
        let value = value.without_url();
        if value.is_timeout() {
            Error::Timeout(value.to_string())
        } else if value.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            Error::NotFound(value.to_string())
        } else if value.is_connect() || value.is_request() || value.status().is_some() {
            Error::Connection(value.to_string())
        } else {
            Error::Io(value.to_string())
        }
    }
}

#[cfg(feature = "cloud")]
impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        match value {
            object_store::Error::NotFound { .. } => Error::NotFound(value.to_string()),
            object_store::Error::Generic { .. } => Error::Connection(value.to_string()),
            e => Error::Io(e.to_string()),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidStorage(format!("unable to parse url: {}", value))
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::Timeout(msg) => Self::new(std::io::ErrorKind::TimedOut, msg),
            e => Self::new(std::io::ErrorKind::Other, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use rstest::rstest;

    #[rstest]
    #[case::connection(Error::Connection("refused".into()), true)]
    #[case::timeout(Error::Timeout("open".into()), true)]
    #[case::not_found(Error::NotFound("band1.tif".into()), false)]
    #[case::io(Error::Io("disk full".into()), false)]
    #[case::unresolved(Error::UnresolvedLocator("foo".into()), false)]
    fn retryable(#[case] err: Error, #[case] exp: bool) {
        assert_eq!(exp, err.is_retryable());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
