//! Error types for OS proxy configuration.

use std::time::Duration;

use thiserror::Error;

/// Errors from reading or writing the OS proxy switch.
#[derive(Debug, Error)]
pub enum SysProxyError {
    /// The platform command could not be started.
    #[error("Failed to run proxy command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command did not finish in time and was killed.
    #[error("Proxy command timed out after {0:?}")]
    Timeout(Duration),

    /// The command exited unsuccessfully.
    #[error("Proxy command failed (exit status {status:?}): {stderr}")]
    CommandFailed {
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The command's output was not understood.
    #[error("Unexpected proxy settings output: {0}")]
    Parse(String),

    /// No implementation for this operating system.
    #[error("System proxy configuration is not supported on {0}")]
    Unsupported(&'static str),
}

/// Result type for OS proxy operations.
pub type SysProxyResult<T> = Result<T, SysProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = SysProxyError::CommandFailed {
            status: Some(1),
            stderr: "access denied".to_string(),
        };
        assert!(err.to_string().contains("access denied"));
        assert!(err.to_string().contains("Some(1)"));
    }

    #[test]
    fn test_timeout_display() {
        let err = SysProxyError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "Proxy command timed out after 2s");
    }
}
