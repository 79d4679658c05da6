//! Stage outcomes and the persisted outcome record

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Schema version written into `status.json` and the checkpoint
pub const SCHEMA_VERSION: u32 = 1;

/// The tagged result of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Stage did what it set out to do
    Success,
    /// Stage failed; routing may still recover via a fail edge
    Fail,
    /// Stage wants another attempt
    Retry,
    /// Stage exhausted retries but was allowed to pass partially
    PartialSuccess,
}

impl Outcome {
    /// Lowercase tag used in edge conditions, context, and artifacts
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
            Outcome::Retry => "retry",
            Outcome::PartialSuccess => "partial_success",
        }
    }

    /// Parse a tag produced by an agent or test attribute
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "success" => Some(Outcome::Success),
            "fail" => Some(Outcome::Fail),
            "retry" => Some(Outcome::Retry),
            "partial_success" => Some(Outcome::PartialSuccess),
            _ => None,
        }
    }

    /// Success or partial success
    pub fn is_success_like(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::PartialSuccess)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted result of one stage (`status.json`)
///
/// Stages propose context updates and routing hints here; the engine
/// owns the merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Record schema version
    pub schema_version: u32,
    /// Outcome tag
    pub outcome: Outcome,
    /// Preferred next-edge label, when the stage wants to steer routing
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

impl StageRecord {
    /// A record with the given outcome and nothing else
    pub fn new(outcome: Outcome) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            outcome,
            preferred_next: None,
            suggested_next_ids: Vec::new(),
            context_updates: BTreeMap::new(),
            notes: None,
            failure_reason: None,
        }
    }

    /// Plain success
    pub fn success() -> Self {
        Self::new(Outcome::Success)
    }

    /// Failure with a reason
    pub fn fail(reason: impl Into<String>) -> Self {
        let mut record = Self::new(Outcome::Fail);
        record.failure_reason = Some(reason.into());
        record
    }

    /// The failure reason, or a placeholder for non-failures
    pub fn reason(&self) -> &str {
        self.failure_reason.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_tags_round_trip() {
        for outcome in [
            Outcome::Success,
            Outcome::Fail,
            Outcome::Retry,
            Outcome::PartialSuccess,
        ] {
            assert_eq!(Outcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(Outcome::parse("skipped"), None);
    }

    #[test]
    fn record_serializes_compactly() {
        let record = StageRecord::success();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["outcome"], "success");
        assert!(value.get("failure_reason").is_none());
        assert!(value.get("context_updates").is_none());
    }

    #[test]
    fn fail_record_carries_reason() {
        let record = StageRecord::fail("tool_exit_code_2");
        assert_eq!(record.outcome, Outcome::Fail);
        assert_eq!(record.reason(), "tool_exit_code_2");
    }
}
