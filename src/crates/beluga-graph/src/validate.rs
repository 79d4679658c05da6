//! Static pipeline validation
//!
//! Validation produces an ordered list of [`Diagnostic`]s; any
//! error-severity finding blocks execution. Diagnostics are sorted by
//! message text so the output is stable regardless of node declaration
//! order.

use crate::error::{GraphError, Result};
use crate::model::{Graph, NodeKind};
use std::collections::BTreeSet;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Blocks execution
    Error,
    /// Suspicious but runnable
    Warning,
    /// Informational only
    Info,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity of the finding
    pub severity: Severity,
    /// Human-readable description, stable across runs
    pub message: String,
}

impl Diagnostic {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Outcome tags accepted in edge condition strings
const ALLOWED_CONDITIONS: [&str; 4] = [
    "outcome=success",
    "outcome=fail",
    "outcome=retry",
    "outcome=partial_success",
];

/// `type` tags whose handlers are deliberately not provided
const REJECTED_TYPE_TAGS: [&str; 5] = ["human", "human_gate", "wait.human", "parallel", "fan_out"];

/// Shapes whose handlers are deliberately not provided
const REJECTED_SHAPES: [&str; 2] = ["parallelogram", "component"];

/// Run all static checks and return the sorted diagnostic list
pub fn validate(graph: &Graph) -> Vec<Diagnostic> {
    let mut diags = Vec::new();

    let starts = graph.start_candidates();
    match starts.len() {
        0 => diags.push(Diagnostic::error("graph has no start node")),
        1 => {}
        _ => {
            let ids: Vec<&str> = starts.iter().map(|n| n.id.as_str()).collect();
            diags.push(Diagnostic::error(format!(
                "graph has multiple start nodes: {}",
                ids.join(", ")
            )));
        }
    }

    if graph.exit_nodes().is_empty() {
        diags.push(Diagnostic::error("graph has no exit node"));
    }

    for node in graph.nodes.values() {
        if node.is_start() && graph.incoming_edges(&node.id).next().is_some() {
            diags.push(Diagnostic::error(format!(
                "start node '{}' has incoming edges",
                node.id
            )));
        }
        if node.is_exit() && graph.outgoing_edges(&node.id).next().is_some() {
            diags.push(Diagnostic::error(format!(
                "exit node '{}' has outgoing edges",
                node.id
            )));
        }

        if let Some(tag) = node.attrs.get_str("type") {
            if REJECTED_TYPE_TAGS.contains(&tag) {
                diags.push(Diagnostic::error(format!(
                    "node '{}' uses unsupported handler type '{}'",
                    node.id, tag
                )));
            }
        }
        if let Some(shape) = node.attrs.get_str("shape") {
            if REJECTED_SHAPES.contains(&shape) {
                diags.push(Diagnostic::error(format!(
                    "node '{}' uses unsupported shape '{}'",
                    node.id, shape
                )));
            }
        }

        if let Some(raw) = node.attrs.get_str("allowed_write_paths") {
            for entry in raw.split(',') {
                let entry = entry.trim();
                if entry.is_empty() {
                    diags.push(Diagnostic::error(format!(
                        "node '{}' has an empty allowed_write_paths entry",
                        node.id
                    )));
                    continue;
                }
                if entry.starts_with('/') {
                    diags.push(Diagnostic::error(format!(
                        "node '{}' allowed_write_paths entry '{}' is absolute",
                        node.id, entry
                    )));
                }
                if entry.split('/').any(|seg| seg == "..") {
                    diags.push(Diagnostic::error(format!(
                        "node '{}' allowed_write_paths entry '{}' contains '..'",
                        node.id, entry
                    )));
                }
            }
        }

        if !node.is_exit()
            && node.kind() != NodeKind::Start
            && graph.outgoing_edges(&node.id).next().is_none()
        {
            diags.push(Diagnostic::warning(format!(
                "node '{}' has no outgoing edges and is not an exit",
                node.id
            )));
        }
    }

    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diags.push(Diagnostic::error(format!(
                    "edge {} -> {} references undefined node '{}'",
                    edge.from, edge.to, endpoint
                )));
            }
        }
        let condition = edge.condition();
        if !condition.is_empty() && !ALLOWED_CONDITIONS.contains(&condition) {
            diags.push(Diagnostic::error(format!(
                "edge {} -> {} has unsupported condition '{}'",
                edge.from, edge.to, condition
            )));
        }
    }

    if let [start] = graph.start_candidates().as_slice() {
        let reachable = reachable_from(graph, &start.id);
        for node in graph.nodes.values() {
            if !reachable.contains(node.id.as_str()) {
                diags.push(Diagnostic::error(format!(
                    "node '{}' is unreachable from the start node",
                    node.id
                )));
            }
        }
    }

    diags.sort_by(|a, b| a.message.cmp(&b.message));
    diags.dedup();
    diags
}

/// Validate and fail if any error-severity diagnostic exists
pub fn validate_or_raise(graph: &Graph) -> Result<()> {
    let diags = validate(graph);
    let errors: Vec<&Diagnostic> = diags
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if errors.is_empty() {
        return Ok(());
    }
    let combined = errors
        .iter()
        .map(|d| d.message.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Err(GraphError::Validation(combined))
}

fn reachable_from<'a>(graph: &'a Graph, start_id: &'a str) -> BTreeSet<&'a str> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut stack = vec![start_id];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for edge in graph.outgoing_edges(id) {
            if graph.nodes.contains_key(&edge.to) {
                stack.push(edge.to.as_str());
            }
        }
    }
    seen
}
