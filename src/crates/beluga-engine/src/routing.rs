//! Deterministic routing
//!
//! Routing is a pure function of (outgoing edges, outcome): conditional
//! edges that match the outcome form the candidate set; otherwise the
//! unconditional edges do. Candidates are ordered by descending weight
//! with ties broken by ascending target id, and the first wins. The
//! full evaluation — every edge with its matched flag — is returned so
//! the trace layer can record the decision.

use crate::outcome::Outcome;
use crate::trace::RouteEdge;
use beluga_graph::{Edge, Graph};

/// The result of evaluating one node's outgoing edges
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Target node id of the chosen edge, when one exists
    pub selected: Option<String>,
    /// Every outgoing edge with its audit flags
    pub evaluated: Vec<RouteEdge>,
}

/// Choose the successor of `node_id` for the given outcome
pub fn select_next_edge(graph: &Graph, node_id: &str, outcome: Outcome) -> RouteDecision {
    let outgoing: Vec<&Edge> = graph.outgoing_edges(node_id).collect();
    let wanted = format!("outcome={}", outcome.as_str());

    let conditional: Vec<&Edge> = outgoing
        .iter()
        .copied()
        .filter(|e| e.condition() == wanted)
        .collect();
    let unconditional: Vec<&Edge> = outgoing
        .iter()
        .copied()
        .filter(|e| e.condition().is_empty())
        .collect();

    let mut candidates = if conditional.is_empty() {
        unconditional
    } else {
        conditional
    };
    candidates.sort_by(|a, b| {
        b.weight()
            .cmp(&a.weight())
            .then_with(|| a.to.cmp(&b.to))
    });
    let selected = candidates.first().map(|e| e.to.clone());

    let evaluated = outgoing
        .iter()
        .map(|edge| RouteEdge {
            to: edge.to.clone(),
            condition: edge.condition().to_string(),
            weight: edge.weight(),
            matched: candidates.iter().any(|c| std::ptr::eq(*c, *edge)),
        })
        .collect();

    RouteDecision {
        selected,
        evaluated,
    }
}
