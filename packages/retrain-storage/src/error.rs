//! Error types for retrain-storage

use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Filesystem I/O errors
    Io,
    /// Serialization/deserialization errors
    Serialization,
    /// Lock could not be acquired before the deadline
    LockTimeout,
    /// No free version name could be allocated
    VersionConflict,
    /// Pointer publish/resolve errors
    Pointer,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::Pointer => "pointer",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {}", path.display(), err)).with_source(err)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn lock_timeout(lock_path: &Path, waited: Option<Duration>) -> Self {
        let message = match waited {
            Some(d) if !d.is_zero() => format!(
                "Another retraining process is currently running (lock {} still held after {}s)",
                lock_path.display(),
                d.as_secs()
            ),
            _ => format!(
                "Another retraining process is currently running (lock {} is held)",
                lock_path.display()
            ),
        };
        Self::new(ErrorKind::LockTimeout, message)
    }

    pub fn version_conflict(root: &Path, base: &str) -> Self {
        Self::new(
            ErrorKind::VersionConflict,
            format!("No free version name for {} under {}", base, root.display()),
        )
    }

    pub fn pointer(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pointer, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn is_lock_timeout(&self) -> bool {
        self.kind == ErrorKind::LockTimeout
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

/// Attach the offending path to a raw I/O result.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| StorageError::io(path, e))
    }
}
