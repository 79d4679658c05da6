//! The run-scoped context store
//!
//! One owned mapping threaded explicitly through the execution loop —
//! no process-wide singletons. Stages propose updates via their outcome
//! record; the engine performs the merge and maintains the reserved
//! keys.

use serde::Serialize;
use std::collections::BTreeMap;

/// Reserved key: graph-level goal mirrored from graph attributes
pub const KEY_GOAL: &str = "graph.goal";
/// Reserved key: id of the node currently executing
pub const KEY_CURRENT_NODE: &str = "current_node";
/// Reserved key: outcome tag of the most recently completed stage
pub const KEY_OUTCOME: &str = "outcome";
/// Default context key for the verification plan
pub const KEY_VERIFICATION_PLAN: &str = "verification.plan";

/// Reserved keys: failure feedback written after each failed stage
pub const KEY_LAST_FAILURE_NODE_ID: &str = "last_failure.node_id";
pub const KEY_LAST_FAILURE_NODE_TYPE: &str = "last_failure.node_type";
pub const KEY_LAST_FAILURE_REASON: &str = "last_failure.reason";
pub const KEY_LAST_FAILURE_TIMESTAMP: &str = "last_failure.timestamp";
pub const KEY_LAST_FAILURE_ARTIFACTS: &str = "last_failure.artifacts";
pub const KEY_LAST_FAILURE_SUMMARY: &str = "last_failure.summary";

/// Per-node retry counter key
pub fn retry_count_key(node_id: &str) -> String {
    format!("internal.retry_count.{node_id}")
}

/// The mutable run context: string keys to JSON values
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RunContext {
    values: BTreeMap<String, serde_json::Value>,
}

impl RunContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from an existing map (graph attrs, checkpoint)
    pub fn from_values(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Raw lookup
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// String lookup
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// Integer lookup
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(|v| v.as_u64())
    }

    /// Insert or replace a value
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Remove a key, returning its previous value
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Merge a batch of updates (later wins)
    pub fn merge(&mut self, updates: &BTreeMap<String, serde_json::Value>) {
        for (k, v) in updates {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Increment a numeric counter key, returning the new value
    pub fn increment(&mut self, key: &str) -> u64 {
        let next = self.get_u64(key).unwrap_or(0) + 1;
        self.values.insert(key.to_string(), serde_json::json!(next));
        next
    }

    /// Full clone of the underlying map
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.values.clone()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Difference between two context snapshots
///
/// Persisted in `NodeOutputCaptured` trace records so an audit can see
/// exactly what each stage touched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextDelta {
    /// Keys present only in the new snapshot
    pub added: BTreeMap<String, serde_json::Value>,
    /// Keys whose value changed
    pub updated: BTreeMap<String, serde_json::Value>,
    /// Keys present only in the old snapshot
    pub removed: Vec<String>,
}

impl ContextDelta {
    /// Compute the delta from `before` to `after`
    pub fn between(
        before: &BTreeMap<String, serde_json::Value>,
        after: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut delta = Self::default();
        for (key, value) in after {
            match before.get(key) {
                None => {
                    delta.added.insert(key.clone(), value.clone());
                }
                Some(old) if old != value => {
                    delta.updated.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                delta.removed.push(key.clone());
            }
        }
        delta
    }

    /// True when nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}
