//! Engine error types
//!
//! The split mirrors the failure model: stage-level problems become
//! outcome records and never appear here; everything in this enum
//! terminates the run (and is recorded as a `PipelineFailed` event
//! before the engine returns).

use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that terminate a pipeline run
#[derive(Error, Debug)]
pub enum EngineError {
    /// Static validation failed; nothing was mutated
    #[error(transparent)]
    Graph(#[from] beluga_graph::GraphError),

    /// A completed stage has no matching outgoing edge
    #[error("no route from node {node} for outcome {outcome}")]
    NoRoute {
        /// The stage that just completed
        node: String,
        /// Its outcome tag
        outcome: String,
    },

    /// The checkpoint's last-completed node has no usable successor
    #[error(
        "resume mismatch: checkpointed node '{node}' has no edge for outcome '{outcome}' and is not an exit"
    )]
    ResumeMismatch {
        /// Last completed node from the checkpoint
        node: String,
        /// Outcome recorded in the checkpointed context
        outcome: String,
    },

    /// The fix stage cannot reach the files that caused the failure
    #[error(
        "unfixable_failure_source: failed node {failed_node} references {paths} outside allowed_write_paths for {current_node}"
    )]
    UnfixableFailureSource {
        /// The tool node that failed
        failed_node: String,
        /// The script paths its command references, comma-separated
        paths: String,
        /// The codergen node that was about to run
        current_node: String,
    },

    /// Deterministic test-stop hook fired after a checkpoint
    #[error("run stopped by test hook after node '{node}'")]
    StoppedForTest {
        /// Node named by the stop trigger
        node: String,
    },

    /// An agent backend failed at the protocol level
    #[error(transparent)]
    Agent(#[from] beluga_agent::AgentError),

    /// A handler or stage produced data the engine cannot interpret
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Filesystem or subprocess I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
