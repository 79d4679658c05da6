//! Error types for graph parsing and validation

use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors produced while building or checking a pipeline graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Pipeline source text could not be parsed
    ///
    /// Carries the offending line (1-based) and a description.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// Line number in the pipeline source (1-based)
        line: usize,
        /// What went wrong
        message: String,
    },

    /// Static validation found at least one error-severity diagnostic
    ///
    /// The message is the combined diagnostic text, one finding per line.
    #[error("pipeline validation failed:\n{0}")]
    Validation(String),
}

impl GraphError {
    /// Create a parse error with positional context
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
