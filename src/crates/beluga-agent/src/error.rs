//! Error types for the agent capability layer

use std::path::PathBuf;
use thiserror::Error;

/// Convenience result type using [`AgentError`]
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by agent backends
///
/// Timeouts are a distinct variant from non-zero exits so the engine can
/// report them separately; both terminate the run rather than downgrade
/// to a stage outcome.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The configured executable does not exist
    #[error("agent executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    /// The configured executable exists but is not executable
    #[error("agent executable is not executable: {0}")]
    ExecutableNotExecutable(PathBuf),

    /// The subprocess exceeded the configured overall timeout
    #[error("agent timed out after {0} seconds")]
    Timeout(u64),

    /// The subprocess exited with a non-zero status
    #[error("agent exited with status {code}")]
    NonZeroExit {
        /// Process exit code, or -1 when killed by a signal
        code: i32,
    },

    /// The agent did not write its output file
    #[error("agent response file missing: {0}")]
    ResponseMissing(PathBuf),

    /// The agent output file did not contain a usable reply
    #[error("malformed agent response in {path}: {reason}")]
    MalformedResponse {
        /// Path to the offending file
        path: PathBuf,
        /// What made it unusable
        reason: String,
    },

    /// Read-scope isolation failed
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// Underlying I/O failure (spawn, stream copy, file write)
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the hide-and-restore protocol
#[derive(Error, Debug)]
pub enum IsolationError {
    /// A block-set entry is absolute or escapes the workspace
    #[error("invalid block path '{0}': must be relative with no parent segments")]
    InvalidBlockPath(String),

    /// A blocked path was recreated while hidden
    ///
    /// Restoring would clobber agent-produced content at the blocked
    /// location, so the restore fails instead of overwriting.
    #[error("cannot restore '{0}': path was recreated while hidden")]
    DestinationRecreated(PathBuf),

    /// Rename failed while hiding or restoring
    #[error("isolation rename failed for '{path}': {source}")]
    Rename {
        /// The path being moved
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Could not create or inspect the hidden directory
    #[error("isolation I/O error: {0}")]
    Io(#[from] std::io::Error),
}
