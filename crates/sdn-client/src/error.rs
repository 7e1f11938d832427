//! SDN client errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when driving the logical network control plane
#[derive(Debug, Error)]
pub enum SdnError {
    /// The control plane command exited with a failure
    #[error("Command `{command}` failed (exit code {code:?}): {stderr}")]
    Command {
        /// Command line that was run
        command: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The control plane did not answer in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Spawning or talking to the command failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Output decoded but did not have the expected shape
    #[error("Unexpected response: {0}")]
    Parse(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SdnError {
    /// Whether retrying the same call later can succeed.
    ///
    /// Process, timeout and I/O failures are treated as a temporarily
    /// unavailable control plane. Malformed requests and responses are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SdnError::Command { .. } | SdnError::Timeout(_) | SdnError::Io(_)
        )
    }
}
