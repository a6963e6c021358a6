//! Error types for the worker watchdog

use thiserror::Error;

use crate::types::status::WatchdogStatus;

/// Main error type for the worker watchdog
#[derive(Error, Debug)]
pub enum WatchdogError {
    /// Engine executable not found or not installed
    #[error("Engine executable not found: {0}")]
    EngineNotFound(String),

    /// Worker process could not be started
    #[error("Launch error: {0}")]
    Launch(String),

    /// Worker did not report startup in time
    #[error("Worker did not report startup within {0} ms")]
    StartupTimeout(u64),

    /// Process execution error with exit code
    #[error("Process error (exit code {exit_code:?}): {message}")]
    Process {
        /// Error message
        message: String,
        /// Process exit code, if the process exited normally
        exit_code: Option<i32>,
    },

    /// JSON decode error when parsing bridge or reattach payloads
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),

    /// Bridge protocol error
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Chunked payload could not be reassembled
    #[error("Chunk error: {0}")]
    Chunk(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reattach information could not be used
    #[error("Reattach error: {0}")]
    Reattach(String),

    /// Artifact slot error
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Operation cancelled by the hosting process
    #[error("Operation cancelled")]
    Cancelled,

    /// Watchdog refused a state transition
    #[error("Invalid watchdog transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status
        from: WatchdogStatus,
        /// Rejected target status
        to: WatchdogStatus,
    },

    /// Retries exhausted; the watchdog gave up
    #[error("Fatal watchdog error: {0}")]
    Fatal(String),
}

/// Result type alias for watchdog operations
pub type Result<T> = std::result::Result<T, WatchdogError>;

impl WatchdogError {
    /// Create an engine-not-found error for the given executable
    pub fn engine_not_found(executable: impl AsRef<std::path::Path>) -> Self {
        Self::EngineNotFound(format!(
            "{} was not found. Set `engine_executable` to an absolute path\n\
             or make sure the engine is on PATH",
            executable.as_ref().display()
        ))
    }

    /// Create a launch error
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Process {
            message: msg.into(),
            exit_code,
        }
    }

    /// Create a bridge error
    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a chunk reassembly error
    pub fn chunk(msg: impl Into<String>) -> Self {
        Self::Chunk(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a reattach error
    pub fn reattach(msg: impl Into<String>) -> Self {
        Self::Reattach(msg.into())
    }

    /// Create an artifact error
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether retrying the failed launch could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::StartupTimeout(_) | Self::Process { .. } | Self::Io(_)
        )
    }
}
