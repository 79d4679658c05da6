//! Append-only run event log
//!
//! One JSON record per line in `events.jsonl`. Events are the coarse
//! operator-facing narrative of a run; the trace log carries the
//! fine-grained audit data.

use crate::error::Result;
use crate::outcome::SCHEMA_VERSION;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Run lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
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
    /// A stage began executing
    StageStarted {
        node_id: String,
        timestamp: String,
    },
    /// A stage finished with a success-like or retry-resolved outcome
    StageCompleted {
        node_id: String,
        outcome: String,
        timestamp: String,
    },
    /// A stage finished with outcome fail
    StageFailed {
        node_id: String,
        reason: String,
        timestamp: String,
    },
    /// A stage requested another attempt
    StageRetrying {
        node_id: String,
        attempt: u32,
        timestamp: String,
    },
    /// A guardrail downgraded a stage outcome
    GuardrailViolation {
        node_id: String,
        detail: String,
        timestamp: String,
    },
    /// The checkpoint was rewritten after a stage
    CheckpointSaved {
        node_id: String,
        timestamp: String,
    },
}

impl Event {
    /// The event's `type` tag as serialized
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PipelineStarted { .. } => "pipeline_started",
            Event::PipelineCompleted { .. } => "pipeline_completed",
            Event::PipelineFailed { .. } => "pipeline_failed",
            Event::StageStarted { .. } => "stage_started",
            Event::StageCompleted { .. } => "stage_completed",
            Event::StageFailed { .. } => "stage_failed",
            Event::StageRetrying { .. } => "stage_retrying",
            Event::GuardrailViolation { .. } => "guardrail_violation",
            Event::CheckpointSaved { .. } => "checkpoint_saved",
        }
    }
}

/// Current UTC time in RFC 3339 form
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339()
}

/// Append-only JSONL writer for [`Event`] records
#[derive(Debug)]
pub struct EventLog {
    file: File,
}

impl EventLog {
    /// Open (or create) the log at `path` in append mode
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append one event as a single JSON line
    pub fn append(&mut self, event: &Event) -> Result<()> {
        let mut value = serde_json::to_value(event)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("schema_version".to_string(), serde_json::json!(SCHEMA_VERSION));
        }
        serde_json::to_writer(&mut self.file, &value)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read every event back from a log file (test and audit helper)
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let text = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        let mut log = EventLog::open(&path).unwrap();

        log.append(&Event::PipelineStarted {
            run_id: "r1".into(),
            pipeline: "G".into(),
            timestamp: timestamp_now(),
        })
        .unwrap();
        log.append(&Event::StageCompleted {
            node_id: "a".into(),
            outcome: "success".into(),
            timestamp: timestamp_now(),
        })
        .unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "pipeline_started");
        assert_eq!(events[1].kind(), "stage_completed");
    }

    #[test]
    fn appended_lines_carry_schema_version() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        let mut log = EventLog::open(&path).unwrap();
        log.append(&Event::CheckpointSaved {
            node_id: "a".into(),
            timestamp: timestamp_now(),
        })
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["type"], "checkpoint_saved");
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        {
            let mut log = EventLog::open(&path).unwrap();
            log.append(&Event::CheckpointSaved {
                node_id: "a".into(),
                timestamp: timestamp_now(),
            })
            .unwrap();
        }
        {
            let mut log = EventLog::open(&path).unwrap();
            log.append(&Event::CheckpointSaved {
                node_id: "b".into(),
                timestamp: timestamp_now(),
            })
            .unwrap();
        }
        assert_eq!(read_events(&path).unwrap().len(), 2);
    }
}
