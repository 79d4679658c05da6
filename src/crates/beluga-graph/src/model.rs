//! Core graph data structures
//!
//! The model is deliberately dumb: nodes and edges carry typed attribute
//! bags and nothing else. Everything behavioral (which handler runs a
//! node, how edges are chosen) is *derived* from attributes at execution
//! time, so unknown keys written by pipeline authors survive round trips
//! untouched.
//!
//! # Structure
//!
//! ```text
//! Graph
//! ├── id                  digraph name
//! ├── attrs               graph-level attribute bag (goal, ...)
//! ├── nodes: id -> Node   attribute bags, kind derived on demand
//! └── edges: Vec<Edge>    ordered as declared; condition + weight
//! ```
//!
//! Node identifiers match `[A-Za-z_][A-Za-z0-9_]*`. The start node is
//! tagged `shape=Mdiamond` (or id `start`); exit nodes are tagged
//! `shape=Msquare` (or id `exit`/`end`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single typed attribute value
///
/// Attribute bags map string keys to one of five scalar shapes. Values
/// that do not parse as one of the richer shapes stay strings, so
/// unknown or free-form keys are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Quoted or bare string
    String(String),
    /// Integer literal
    Integer(i64),
    /// Float literal
    Float(f64),
    /// `true` / `false`
    Boolean(bool),
    /// Duration literal such as `30s` or `500ms`
    ///
    /// The raw text is kept so the value can be re-emitted exactly.
    Duration {
        /// Parsed magnitude in milliseconds
        millis: u64,
        /// Original literal as written
        raw: String,
    },
}

impl AttrValue {
    /// Convert to a JSON value for mirroring into the run context
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::String(s) => serde_json::Value::String(s.clone()),
            AttrValue::Integer(i) => serde_json::json!(i),
            AttrValue::Float(f) => serde_json::json!(f),
            AttrValue::Boolean(b) => serde_json::Value::Bool(*b),
            AttrValue::Duration { raw, .. } => serde_json::Value::String(raw.clone()),
        }
    }

    /// String view; durations and scalars are not coerced
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// An attribute bag: ordered string keys to typed values
///
/// `BTreeMap` keeps iteration deterministic, which matters for
/// diagnostics and for serialized artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attrs(pub BTreeMap<String, AttrValue>);

impl Attrs {
    /// Empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: AttrValue) {
        self.0.insert(key.into(), value);
    }

    /// Merge `other` over `self` (later wins)
    pub fn merge(&mut self, other: &Attrs) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Raw lookup
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    /// String lookup (quoted or bare values only)
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Boolean lookup; also accepts the strings "true"/"false"
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            AttrValue::Boolean(b) => Some(*b),
            AttrValue::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer lookup; also accepts integer-valued strings
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            AttrValue::Integer(i) => Some(*i),
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Duration lookup in milliseconds
    pub fn get_duration_ms(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            AttrValue::Duration { millis, .. } => Some(*millis),
            AttrValue::Integer(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    /// Iterate key/value pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    /// True when the bag holds no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handler kind derived from a node's attributes
///
/// The set is closed: the engine dispatches on this tag rather than on
/// runtime polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Structural entry node; no side effects
    Start,
    /// Structural terminal node; no side effects
    Exit,
    /// Runs a single shell command relative to the workspace
    Tool,
    /// Executes a structured verification plan from run context
    Verification,
    /// Invokes the agent capability
    Codergen,
}

impl NodeKind {
    /// Lowercase tag used in logs and artifacts
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Exit => "exit",
            NodeKind::Tool => "tool",
            NodeKind::Verification => "verification",
            NodeKind::Codergen => "codergen",
        }
    }
}

/// A pipeline stage declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the graph
    pub id: String,
    /// Attribute bag (defaults merged under per-node declarations)
    pub attrs: Attrs,
}

impl Node {
    /// Create a node with an empty attribute bag
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attrs::new(),
        }
    }

    /// True for the structural entry node
    pub fn is_start(&self) -> bool {
        self.attrs.get_str("shape") == Some("Mdiamond") || self.id == "start"
    }

    /// True for structural terminal nodes
    pub fn is_exit(&self) -> bool {
        self.attrs.get_str("shape") == Some("Msquare")
            || matches!(self.id.to_ascii_lowercase().as_str(), "exit" | "end")
    }

    /// Derive the handler kind for this node
    ///
    /// Start/exit tagging wins; an explicit `type` attribute is honored
    /// next; a `tool_command` implies a tool stage; everything else is an
    /// agent stage.
    pub fn kind(&self) -> NodeKind {
        if self.is_start() {
            return NodeKind::Start;
        }
        if self.is_exit() {
            return NodeKind::Exit;
        }
        match self.attrs.get_str("type") {
            Some("tool") => NodeKind::Tool,
            Some("verification") => NodeKind::Verification,
            Some("codergen") => NodeKind::Codergen,
            _ => {
                if self.attrs.get_str("tool_command").is_some() {
                    NodeKind::Tool
                } else {
                    NodeKind::Codergen
                }
            }
        }
    }

    /// Node label, falling back to the id
    pub fn label(&self) -> &str {
        self.attrs.get_str("label").unwrap_or(&self.id)
    }
}

/// A directed edge between two stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id
    pub from: String,
    /// Target node id
    pub to: String,
    /// Attribute bag (`condition`, `weight`, `label`, ...)
    pub attrs: Attrs,
}

impl Edge {
    /// Create an edge with an empty attribute bag
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            attrs: Attrs::new(),
        }
    }

    /// The outcome condition string, or empty for unconditional edges
    pub fn condition(&self) -> &str {
        self.attrs.get_str("condition").unwrap_or("")
    }

    /// Routing weight, default 0
    pub fn weight(&self) -> i64 {
        self.attrs.get_i64("weight").unwrap_or(0)
    }
}

/// The immutable in-memory pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Digraph name from the source text
    pub id: String,
    /// Graph-level attributes (`goal`, ...)
    pub attrs: Attrs,
    /// All declared nodes keyed by id
    pub nodes: BTreeMap<String, Node>,
    /// Edges in declaration order
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Empty graph with the given name
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes tagged as the structural entry
    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.is_start()).collect()
    }

    /// The unique start node, when the graph is well formed
    pub fn start_node(&self) -> Option<&Node> {
        let candidates = self.start_candidates();
        match candidates.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// All nodes tagged as terminal
    pub fn exit_nodes(&self) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.is_exit()).collect()
    }

    /// Outgoing edges of a node, in declaration order
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Incoming edges of a node, in declaration order
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    /// Mirror graph attributes into JSON under `graph.<key>`
    ///
    /// The engine seeds the run context with this map at run start.
    pub fn context_seed(&self) -> BTreeMap<String, serde_json::Value> {
        self.attrs
            .iter()
            .map(|(k, v)| (format!("graph.{k}"), v.to_json()))
            .collect()
    }

    /// The graph-level goal attribute, when present
    pub fn goal(&self) -> Option<&str> {
        self.attrs.get_str("goal")
    }
}

/// Check the node-identifier lexical rule `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
