//! Run checkpoint: the resume point written after every stage
//!
//! The checkpoint is rewritten (atomically, via a temp file rename)
//! after each node completes. It is deliberately last in the per-stage
//! write order: events and artifacts already on disk can be replayed,
//! and a crash between stages leaves either the old or the new
//! checkpoint, never a torn one.

use crate::error::Result;
use crate::outcome::SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Stateful resume point for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint schema version
    pub schema_version: u32,
    /// Run this checkpoint belongs to
    pub run_id: String,
    /// The most recently completed node
    pub last_completed_node: String,
    /// All completed node ids, sorted
    pub completed_nodes: Vec<String>,
    /// Retry counters per node id
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u64>,
    /// Full context snapshot at checkpoint time
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Checkpoint {
    /// Build a checkpoint; `completed_nodes` is sorted here
    pub fn new(
        run_id: impl Into<String>,
        last_completed_node: impl Into<String>,
        mut completed_nodes: Vec<String>,
        retry_counts: BTreeMap<String, u64>,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        completed_nodes.sort();
        completed_nodes.dedup();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.into(),
            last_completed_node: last_completed_node.into(),
            completed_nodes,
            retry_counts,
            context,
        }
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a checkpoint from disk
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// True once `node_id` has completed in this run
    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node_id)
    }
}
