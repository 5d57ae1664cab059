use retrain_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Lock unavailable: {0}")]
    LockTimeout(String),

    #[error("Command failed ({}): {command}\n{output}", exit_label(.exit_code))]
    StepFailure {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Command timed out after {timeout_secs}s: {command}\n{output}")]
    StepTimeout {
        command: String,
        timeout_secs: u64,
        output: String,
    },

    #[error("Publish failed: {0}")]
    PublishFailure(String),

    #[error("Reload notification failed: {0}")]
    NotifyFailure(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "no exit code".to_string(),
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        if err.is_lock_timeout() {
            OrchestratorError::LockTimeout(err.message)
        } else {
            OrchestratorError::Storage(err)
        }
    }
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn publish<E: std::fmt::Display>(e: E) -> Self {
        Self::PublishFailure(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::LockTimeout(_) => ErrorCategory::Recoverable,
            OrchestratorError::NotifyFailure(_) => ErrorCategory::NonFatal,
            _ => ErrorCategory::Fatal,
        }
    }
}

/// How an error affects the run and the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Lock unavailable - retry later (exit code 2)
    Recoverable,
    /// Run aborted (exit code 1)
    Fatal,
    /// Logged only, run outcome unchanged
    NonFatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Recoverable => "recoverable",
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::NonFatal => "non_fatal",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorCategory::Recoverable => 2,
            ErrorCategory::Fatal => 1,
            ErrorCategory::NonFatal => 0,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_step_failure_message_carries_output() {
        let err = OrchestratorError::StepFailure {
            command: "python3 train_bert4rec.py".to_string(),
            exit_code: Some(1),
            output: "RuntimeError: CUDA out of memory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Command failed (1): python3 train_bert4rec.py"));
        assert!(msg.contains("CUDA out of memory"));
    }

    #[test]
    fn test_killed_step_has_no_exit_code() {
        let err = OrchestratorError::StepFailure {
            command: "train".to_string(),
            exit_code: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("(no exit code)"));
    }

    #[test]
    fn test_storage_lock_timeout_becomes_lock_timeout() {
        let storage = StorageError::lock_timeout(Path::new("retrain.lock"), None);
        let err: OrchestratorError = storage.into();
        assert!(matches!(err, OrchestratorError::LockTimeout(_)));
        assert_eq!(err.category(), ErrorCategory::Recoverable);
        assert_eq!(err.category().exit_code(), 2);
    }

    #[test]
    fn test_other_storage_errors_are_fatal() {
        let err: OrchestratorError = StorageError::pointer("rename failed").into();
        assert!(matches!(err, OrchestratorError::Storage(_)));
        assert_eq!(err.category().exit_code(), 1);
    }

    #[test]
    fn test_notify_failure_is_non_fatal() {
        let err = OrchestratorError::NotifyFailure("connection refused".to_string());
        assert_eq!(err.category(), ErrorCategory::NonFatal);
        assert_eq!(err.category().as_str(), "non_fatal");
    }
}
