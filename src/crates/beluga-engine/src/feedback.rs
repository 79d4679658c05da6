//! Failure-feedback synthesis
//!
//! When a stage fails, the engine captures what is actually on disk for
//! that stage and distills it into a bounded summary under well-known
//! `last_failure.*` context keys. Subsequent codergen stages read the
//! summary through their prompt decoration; the keys persist until the
//! next failure overwrites them.

use crate::context;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Tail bytes kept per artifact
const TAIL_BYTES: usize = 600;
/// Tail bytes kept for stdout artifacts
const TAIL_BYTES_STDOUT: usize = 300;
/// Overall summary cap in characters
const SUMMARY_CAP: usize = 2_200;

/// Artifact files considered for the feedback map, by stable name
const ARTIFACT_FILES: [(&str, &str); 10] = [
    ("status", "status.json"),
    ("workspace_diff", "workspace.diff.json"),
    ("tool_stdout", "tool.stdout.txt"),
    ("tool_stderr", "tool.stderr.txt"),
    ("tool_exitcode", "tool.exitcode.txt"),
    ("verification_plan", "verification.plan.json"),
    ("verification_results", "verification.results.json"),
    ("agent_stdout", "agent.stdout.log"),
    ("agent_stderr", "agent.stderr.log"),
    ("agent_response", "response.md"),
];

/// Artifacts folded into the text summary, in order, with their tail size
const SUMMARY_SOURCES: [(&str, usize); 6] = [
    ("tool.stderr.txt", TAIL_BYTES),
    ("tool.stdout.txt", TAIL_BYTES_STDOUT),
    ("verification.results.json", TAIL_BYTES),
    ("agent.stderr.log", TAIL_BYTES),
    ("agent.stdout.log", TAIL_BYTES_STDOUT),
    ("response.md", TAIL_BYTES),
];

/// Build the `last_failure.*` context updates for a failed stage
pub fn synthesize(
    node_id: &str,
    node_type: &str,
    reason: &str,
    artifact_dir: &Path,
) -> BTreeMap<String, serde_json::Value> {
    let mut artifacts = BTreeMap::new();
    for (name, file) in ARTIFACT_FILES {
        let path = artifact_dir.join(file);
        if path.is_file() {
            artifacts.insert(name.to_string(), json!(path.to_string_lossy()));
        }
    }

    let mut updates = BTreeMap::new();
    updates.insert(
        context::KEY_LAST_FAILURE_NODE_ID.to_string(),
        json!(node_id),
    );
    updates.insert(
        context::KEY_LAST_FAILURE_NODE_TYPE.to_string(),
        json!(node_type),
    );
    updates.insert(context::KEY_LAST_FAILURE_REASON.to_string(), json!(reason));
    updates.insert(
        context::KEY_LAST_FAILURE_TIMESTAMP.to_string(),
        json!(Utc::now().to_rfc3339()),
    );
    updates.insert(
        context::KEY_LAST_FAILURE_ARTIFACTS.to_string(),
        json!(artifacts),
    );
    updates.insert(
        context::KEY_LAST_FAILURE_SUMMARY.to_string(),
        json!(summarize(node_id, reason, artifact_dir)),
    );
    updates
}

/// Concatenate labeled tail snippets into a bounded summary
fn summarize(node_id: &str, reason: &str, artifact_dir: &Path) -> String {
    let mut summary = format!("node '{node_id}' failed: {reason}\n");
    for (file, tail_bytes) in SUMMARY_SOURCES {
        let path = artifact_dir.join(file);
        let Ok(contents) = fs::read(&path) else {
            continue;
        };
        let tail = tail_of(&contents, tail_bytes);
        if tail.trim().is_empty() {
            continue;
        }
        summary.push_str(&format!("--- {file} (tail) ---\n{tail}\n"));
    }
    truncate_chars(&summary, SUMMARY_CAP)
}

/// Last `n` bytes of a buffer as lossy UTF-8
fn tail_of(contents: &[u8], n: usize) -> String {
    let start = contents.len().saturating_sub(n);
    String::from_utf8_lossy(&contents[start..]).to_string()
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    s.chars().take(cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_records_only_existing_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("status.json"), "{}").unwrap();
        fs::write(tmp.path().join("tool.stderr.txt"), "boom").unwrap();

        let updates = synthesize("build", "tool", "tool_exit_code_2", tmp.path());
        let artifacts = updates
            .get(context::KEY_LAST_FAILURE_ARTIFACTS)
            .and_then(|v| v.as_object())
            .unwrap();
        assert!(artifacts.contains_key("status"));
        assert!(artifacts.contains_key("tool_stderr"));
        assert!(!artifacts.contains_key("tool_stdout"));

        assert_eq!(
            updates.get(context::KEY_LAST_FAILURE_NODE_ID),
            Some(&json!("build"))
        );
        assert_eq!(
            updates.get(context::KEY_LAST_FAILURE_NODE_TYPE),
            Some(&json!("tool"))
        );
    }

    #[test]
    fn summary_contains_labeled_tails() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("tool.stderr.txt"), "error: missing symbol").unwrap();
        fs::write(tmp.path().join("tool.stdout.txt"), "compiling...").unwrap();

        let updates = synthesize("build", "tool", "tool_exit_code_1", tmp.path());
        let summary = updates
            .get(context::KEY_LAST_FAILURE_SUMMARY)
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(summary.contains("node 'build' failed: tool_exit_code_1"));
        assert!(summary.contains("tool.stderr.txt"));
        assert!(summary.contains("missing symbol"));
        assert!(summary.contains("compiling..."));
    }

    #[test]
    fn summary_tails_and_caps_are_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("tool.stderr.txt"), "e".repeat(5_000)).unwrap();
        fs::write(tmp.path().join("tool.stdout.txt"), "o".repeat(5_000)).unwrap();
        fs::write(tmp.path().join("agent.stderr.log"), "a".repeat(5_000)).unwrap();

        let updates = synthesize("n", "tool", "r", tmp.path());
        let summary = updates
            .get(context::KEY_LAST_FAILURE_SUMMARY)
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(summary.chars().count() <= SUMMARY_CAP);
        // stdout contributes at most 300 bytes of payload
        let stdout_run = summary
            .split("tool.stdout.txt (tail) ---\n")
            .nth(1)
            .unwrap()
            .chars()
            .take_while(|c| *c == 'o')
            .count();
        assert!(stdout_run <= TAIL_BYTES_STDOUT);
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let tmp = tempfile::tempdir().unwrap();
        let updates = synthesize("n", "codergen", "r", tmp.path());
        let ts = updates
            .get(context::KEY_LAST_FAILURE_TIMESTAMP)
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
