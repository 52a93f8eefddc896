//! Error types used across the buildhook dispatcher.

use thiserror::Error;

/// Result type for buildhook operations.
pub type HookResult<T> = Result<T, HookError>;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("failed to connect to '{host}': {reason}")]
    Connect { host: String, reason: String },

    #[error("{msg} on '{host}'")]
    RemoteBuild {
        host: String,
        msg: String,
        status: u64,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HookError {
    /// Exit code the hook process should terminate with for this error.
    ///
    /// A remote build failure propagates the worker-reported status; the
    /// u64 wire status is truncated to the 8-bit exit-code domain, with 1
    /// substituted when truncation would turn a nonzero status into 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            HookError::RemoteBuild { status, .. } => {
                let code = (status & 0xff) as i32;
                if code == 0 { 1 } else { code }
            }
            _ => 1,
        }
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for HookError {
    fn from(err: std::io::Error) -> Self {
        HookError::Internal(format!("I/O error: {}", err))
    }
}

impl From<String> for HookError {
    fn from(err: String) -> Self {
        HookError::Internal(err)
    }
}

impl From<&str> for HookError {
    fn from(err: &str) -> Self {
        HookError::Internal(err.to_string())
    }
}
