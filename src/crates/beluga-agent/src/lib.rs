//! Agent capability layer for beluga
//!
//! An agent is anything that can take a prompt and produce a structured
//! outcome for a pipeline stage: `run(prompt, node_id, artifact_dir,
//! workspace) -> reply`. The engine does not care what sits behind the
//! capability; this crate ships the two built-ins:
//!
//! - [`StubAgent`] — a no-op backend that always succeeds; useful for
//!   exercising pipeline structure without a model.
//! - [`ExternalProcessAgent`] — spawns a configured executable, feeds it
//!   the prompt on stdin, tails its streams to per-node log files, and
//!   parses a structured JSON reply from its output file.
//!
//! The external adapter also owns the **read-scope isolation** layer
//! ([`isolation`]): before the subprocess starts, blocked workspace
//! subtrees are renamed away into a run-scoped hidden directory and
//! restored — in reverse order, on every exit path — when the stage
//! finishes.

pub mod capability;
pub mod error;
pub mod external;
pub mod isolation;

pub use capability::{Agent, AgentReply, AgentRequest, StubAgent};
pub use error::{AgentError, Result};
pub use external::{ExternalAgentConfig, ExternalProcessAgent};
pub use isolation::{HideAndRestore, ReadScope};
