//! Run configuration surface
//!
//! Everything the engine recognizes at run time, grouped by concern:
//! workspace coordinates, agent backend selection, test hooks, and
//! logging. This is an in-process struct filled by the embedding
//! front-end; the engine reads no config files.

use beluga_agent::ExternalAgentConfig;
use std::path::PathBuf;

/// Environment variable for the deterministic stop-after-node test hook
pub const STOP_AFTER_NODE_ENV: &str = "BELUGA_TEST_STOP_AFTER_NODE";

/// Which agent capability backs codergen stages
#[derive(Debug, Clone, Default)]
pub enum AgentBackend {
    /// No-op backend that always succeeds
    #[default]
    Stub,
    /// Deterministic fake driven by `test.*` node attributes
    TestFake,
    /// External executable adapter
    External(ExternalAgentConfig),
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive for this level
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line records
    #[default]
    Text,
    /// One JSON object per record
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum level emitted
    pub level: LogLevel,
    /// Record format
    pub format: LogFormat,
    /// Echo external-agent output into the engine's log stream live
    pub agent_stream_live: bool,
}

/// Full run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory whose contents seed the run workspace
    pub source_dir: PathBuf,
    /// Directory under which run directories are created
    pub runs_root: PathBuf,
    /// Explicit run id; a fresh one is generated when absent
    pub run_id: Option<String>,
    /// Resume the checkpointed run identified by `run_id`
    pub resume: bool,
    /// Agent backend for codergen stages
    pub backend: AgentBackend,
    /// Test hook: stop the run after this node's checkpoint is written
    pub stop_after_node: Option<String>,
    /// Logging configuration
    pub logging: LogConfig,
}

impl RunConfig {
    /// Config with defaults for everything but the two directories
    ///
    /// The stop-after-node hook is seeded from the
    /// `BELUGA_TEST_STOP_AFTER_NODE` environment variable when set.
    pub fn new(source_dir: impl Into<PathBuf>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            runs_root: runs_root.into(),
            run_id: None,
            resume: false,
            backend: AgentBackend::default(),
            stop_after_node: std::env::var(STOP_AFTER_NODE_ENV).ok().filter(|s| !s.is_empty()),
            logging: LogConfig::default(),
        }
    }

    /// Use the deterministic test-fake backend
    pub fn with_test_backend(mut self) -> Self {
        self.backend = AgentBackend::TestFake;
        self
    }

    /// Use an explicit run id
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stub_backend_fresh_run() {
        let config = RunConfig::new("/src", "/runs");
        assert!(matches!(config.backend, AgentBackend::Stub));
        assert!(!config.resume);
        assert!(config.run_id.is_none());
    }

    #[test]
    fn builders_override_fields() {
        let config = RunConfig::new("/src", "/runs")
            .with_test_backend()
            .with_run_id("r-42");
        assert!(matches!(config.backend, AgentBackend::TestFake));
        assert_eq!(config.run_id.as_deref(), Some("r-42"));
    }
}
