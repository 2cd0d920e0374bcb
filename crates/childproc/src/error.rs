//! Error types for child process management

use std::io;
use thiserror::Error;

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to create the pipes or the child process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Write attempted on a process that was not spawned with `open_stdin`
    #[error("Can't write to an unopened stdin pipe; set open_stdin when configuring the process")]
    StdinNotOpen,

    /// Failed to install the child-exit signal handler
    #[error("Failed to install SIGCHLD handler: {0}")]
    SignalHandler(String),
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
