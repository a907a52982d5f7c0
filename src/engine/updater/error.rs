//! Updater Error Types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Incomplete response body: {0}")]
    IncompleteBody(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Request failed: {0}")]
    Other(String),
}

impl NetworkError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset(_) | Self::Timeout(_) | Self::IncompleteBody(_)
        )
    }

    fn from_io_kind(kind: io::ErrorKind, message: String) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Some(Self::ConnectionReset(message)),
            io::ErrorKind::TimedOut => Some(Self::Timeout(message)),
            io::ErrorKind::UnexpectedEof => Some(Self::IncompleteBody(message)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        let message = e.to_string();
        if e.is_timeout() {
            return Self::Timeout(message);
        }

        let mut source = std::error::Error::source(&e);
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if let Some(classified) = Self::from_io_kind(io_err.kind(), message.clone()) {
                    return classified;
                }
            }
            source = err.source();
        }

        if e.is_body() {
            Self::IncompleteBody(message)
        } else {
            Self::Other(message)
        }
    }
}

impl From<NetworkError> for io::Error {
    fn from(e: NetworkError) -> Self {
        let kind = match &e {
            NetworkError::ConnectionReset(_) => io::ErrorKind::ConnectionReset,
            NetworkError::Timeout(_) => io::ErrorKind::TimedOut,
            NetworkError::IncompleteBody(_) => io::ErrorKind::UnexpectedEof,
            NetworkError::Status(_) | NetworkError::Other(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Content did not match what was recorded or promised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Size mismatch for {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Package hash mismatch: expected {expected}, got {actual}")]
    PackageHashMismatch { expected: String, actual: String },
}

/// Bundle or verification metadata is missing, malformed or incomplete.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed manifest {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Bundle manifest {0} has an empty version")]
    EmptyVersion(PathBuf),

    #[error("Bundle manifest {0} lists no entry points")]
    NoEntryPoints(PathBuf),

    #[error("Entry point {0} is not covered by the verification manifest")]
    UnverifiedEntryPoint(String),

    #[error("Unsafe path in manifest: {0}")]
    UnsafePath(String),
}

/// The remote manifest could not be used.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Update server answered with HTTP {0}")]
    BadStatus(u16),

    #[error("Update manifest has no entry for application {0}")]
    MissingApp(String),

    #[error("Update manifest names an unusable version: {0:?}")]
    InvalidVersion(String),

    #[error("Malformed update manifest: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Why a bundle on disk failed verification.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Archive extraction failures.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive entry escapes the bundle directory: {0}")]
    UnsafeEntry(String),
}

/// Anything that can fail an update run.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl UpdateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<VerifyError> for UpdateError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Integrity(e) => Self::Integrity(e),
            VerifyError::Manifest(e) => Self::Manifest(e),
            VerifyError::Io { path, source } => Self::io(format!("{}", path.display()), source),
        }
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NetworkError::ConnectionReset("reset".into()).is_transient());
        assert!(NetworkError::Timeout("slow".into()).is_transient());
        assert!(NetworkError::IncompleteBody("eof".into()).is_transient());
        assert!(!NetworkError::Status(404).is_transient());
        assert!(!NetworkError::Other("dns".into()).is_transient());
    }

    #[test]
    fn test_io_kind_mapping() {
        let reset = NetworkError::from_io_kind(io::ErrorKind::ConnectionReset, "x".into());
        assert_eq!(reset, Some(NetworkError::ConnectionReset("x".into())));
        assert_eq!(
            NetworkError::from_io_kind(io::ErrorKind::PermissionDenied, "x".into()),
            None
        );

        let io_err: io::Error = NetworkError::Timeout("t".into()).into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_verify_error_flattens_into_update_error() {
        let err: UpdateError = VerifyError::Integrity(IntegrityError::SizeMismatch {
            path: "a.js".into(),
            expected: 1,
            actual: 2,
        })
        .into();
        assert!(matches!(
            err,
            UpdateError::Integrity(IntegrityError::SizeMismatch { .. })
        ));
    }
}
