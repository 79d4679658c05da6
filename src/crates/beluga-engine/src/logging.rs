//! Logging bootstrap
//!
//! Thin wrapper over `tracing-subscriber`: level and format come from
//! [`LogConfig`], with `RUST_LOG` taking precedence when set. Transport
//! and colorization beyond this are the embedder's concern.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber for this process
///
/// Safe to call more than once; subsequent calls are no-ops (the first
/// subscriber wins), which keeps test binaries that share a process
/// from panicking.
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialized; keeping existing subscriber");
    }
}
