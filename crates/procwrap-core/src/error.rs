//! Error types for procwrap.
//!
//! Structural failures (disposed handle, launch failure) are returned to the
//! caller. Operational failures during cancellation, draining, or teardown are
//! logged where they happen and only surface here so they can be formatted.

use crate::process::OutputSource;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the procwrap library.
#[derive(Debug, Error)]
pub enum ProcwrapError {
    // Lifecycle errors
    #[error("Process handle has been disposed")]
    Disposed,

    #[error("Process has already been started")]
    AlreadyStarted,

    #[error("Process has not been started")]
    NotStarted,

    #[error("Failed to launch {program:?}: {source}")]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Teardown errors (logged, not returned from the operation that hit them)
    #[error("Failed to terminate process tree {pid}: {message}")]
    CancellationFailed { pid: u32, message: String },

    #[error("Failed to read {stream} of process {pid}: {source}")]
    StreamRead {
        stream: OutputSource,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to collect exit status of process {pid}: {message}")]
    Finalization { pid: u32, message: String },

    // Configuration errors
    #[error("Invalid process spec: {message}")]
    InvalidSpec { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for procwrap operations.
pub type Result<T> = std::result::Result<T, ProcwrapError>;

impl From<std::io::Error> for ProcwrapError {
    fn from(err: std::io::Error) -> Self {
        ProcwrapError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProcwrapError {
    fn from(err: serde_json::Error) -> Self {
        ProcwrapError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ProcwrapError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ProcwrapError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check whether this error comes from using a handle outside its lifecycle.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ProcwrapError::Disposed | ProcwrapError::AlreadyStarted | ProcwrapError::NotStarted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProcwrapError::Disposed.to_string(),
            "Process handle has been disposed"
        );

        let err = ProcwrapError::LaunchFailed {
            program: PathBuf::from("/no/such/tool"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("Failed to launch \"/no/such/tool\""));
    }

    #[test]
    fn test_stream_read_display() {
        let err = ProcwrapError::StreamRead {
            stream: OutputSource::Stderr,
            pid: 42,
            source: std::io::Error::other("broken pipe"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to read stderr of process 42: broken pipe"
        );
    }

    #[test]
    fn test_lifecycle_errors() {
        assert!(ProcwrapError::Disposed.is_lifecycle());
        assert!(ProcwrapError::NotStarted.is_lifecycle());
        assert!(!ProcwrapError::Other("x".into()).is_lifecycle());
    }

    #[test]
    fn test_io_with_path() {
        let err = ProcwrapError::io_with_path(
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            "/tmp/spec.json",
        );
        match err {
            ProcwrapError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/spec.json")))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
