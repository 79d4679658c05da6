//! Pipeline graph model for beluga
//!
//! A pipeline is a directed graph of stages described in a DOT subset.
//! This crate owns the three static layers of that graph:
//!
//! - **Model**: [`Graph`], [`Node`], [`Edge`], and typed attribute bags
//!   ([`AttrValue`]) that preserve unknown keys verbatim.
//! - **Parser**: [`parse_dot`] turns pipeline source text into a [`Graph`].
//! - **Validator**: [`validate`] produces an ordered diagnostic list;
//!   [`validate_or_raise`] aborts on the first run with any error.
//!
//! Execution semantics (handlers, routing, retries) live in
//! `beluga-engine`; this crate is purely the immutable in-memory
//! representation plus its static checks.

pub mod error;
pub mod model;
pub mod parser;
pub mod validate;

pub use error::{GraphError, Result};
pub use model::{AttrValue, Attrs, Edge, Graph, Node, NodeKind};
pub use parser::parse_dot;
pub use validate::{validate, validate_or_raise, Diagnostic, Severity};
