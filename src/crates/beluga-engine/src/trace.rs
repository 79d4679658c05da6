//! Structured trace log
//!
//! The trace is the fine-grained audit companion to the event log: full
//! context captures on stage entry, context deltas on stage exit, and a
//! record of every routing decision with the edges that were considered.
//! One JSON record per line in `trace.jsonl`, append-only.

use crate::context::ContextDelta;
use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// One outgoing edge as seen by the router
#[derive(Debug, Clone, Serialize)]
pub struct RouteEdge {
    /// Edge target node id
    pub to: String,
    /// Condition string, empty for unconditional edges
    pub condition: String,
    /// Routing weight
    pub weight: i64,
    /// Whether the edge was in the candidate set for this outcome
    pub matched: bool,
}

/// Trace record types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceRecord {
    /// Run directory initialized and logs opened
    SessionInitialized {
        run_id: String,
        engine_version: String,
        timestamp: String,
    },
    /// Run began executing
    PipelineStarted {
        run_id: String,
        pipeline: String,
        timestamp: String,
    },
    /// Run reached an exit node
    PipelineCompleted {
        run_id: String,
        timestamp: String,
    },
    /// Run terminated with an engine error
    PipelineFailed {
        run_id: String,
        error: String,
        timestamp: String,
    },
    /// Full input capture at stage entry
    NodeInputCaptured {
        node_id: String,
        context: BTreeMap<String, serde_json::Value>,
        attributes: BTreeMap<String, serde_json::Value>,
        artifact_dir: String,
        timestamp: String,
    },
    /// Context delta at stage exit
    NodeOutputCaptured {
        node_id: String,
        outcome: String,
        context_delta: ContextDelta,
        timestamp: String,
    },
    /// Routing decision with every edge considered
    RouteEvaluated {
        node_id: String,
        outcome: String,
        edges: Vec<RouteEdge>,
        selected: Option<String>,
        timestamp: String,
    },
    /// A handler raised an engine-level error
    NodeExecutionErrored {
        node_id: String,
        error: String,
        timestamp: String,
    },
    /// A checkpoint was loaded to resume this run
    ResumeLoaded {
        run_id: String,
        last_completed_node: String,
        timestamp: String,
    },
}

/// Current UTC time in RFC 3339 form
fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Append-only JSONL writer for [`TraceRecord`]s
#[derive(Debug)]
pub struct TraceLog {
    file: File,
}

impl TraceLog {
    /// Open (or create) the log at `path` in append mode
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append one record as a single JSON line
    pub fn append(&mut self, record: &TraceRecord) -> Result<()> {
        serde_json::to_writer(&mut self.file, record)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    /// Timestamp helper so callers build records with a uniform clock
    pub fn stamp() -> String {
        now()
    }
}
