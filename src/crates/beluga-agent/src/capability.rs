//! The agent capability seam
//!
//! [`Agent`] is the interchangeable-provider boundary: the engine hands
//! a stage's assembled prompt plus its filesystem coordinates to
//! whatever backend is configured and gets back an [`AgentReply`]. The
//! reply is data, never control flow; the engine folds it into the
//! stage's outcome record.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything a backend needs to execute one stage
#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    /// Fully assembled prompt text (substitutions and decorations done)
    pub prompt: &'a str,
    /// Id of the node being executed
    pub node_id: &'a str,
    /// Artifact directory for this node visit
    pub artifact_dir: &'a Path,
    /// Per-run workspace the agent may read and write
    pub workspace: &'a Path,
}

/// Structured reply from an agent backend
///
/// Mirrors the outcome-record schema: the `outcome` tag is required and
/// non-empty; everything else is optional color.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    /// Outcome tag: success, fail, retry, or partial_success
    pub outcome: String,
    /// Preferred next-edge label, when the agent wants to steer routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_next: Option<String>,
    /// Suggested successor node ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_next_ids: Vec<String>,
    /// Context updates to merge into the run context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_updates: BTreeMap<String, serde_json::Value>,
    /// Free-text notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Failure reason when the outcome is fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl AgentReply {
    /// A plain success reply
    pub fn success() -> Self {
        Self {
            outcome: "success".to_string(),
            ..Self::default()
        }
    }
}

/// The interchangeable agent provider
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute one stage and return its structured reply
    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentReply>;
}

/// No-op backend that always returns success
///
/// Lets a pipeline's structure, routing, and guardrails be exercised
/// without any model behind the codergen stages.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubAgent;

#[async_trait]
impl Agent for StubAgent {
    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentReply> {
        tracing::debug!(node_id = request.node_id, "stub agent returning success");
        Ok(AgentReply::success())
    }
}
