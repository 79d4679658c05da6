//! Guardrails: static tool-command filtering and the
//! unfixable-failure-source check
//!
//! Guardrails never throw for policy reasons — a violated policy
//! becomes a stage-level `fail` outcome — with one exception: the
//! unfixable-failure-source check aborts the run outright, because
//! continuing would burn fix-loop cycles on a failure the fix stage is
//! not allowed to touch.

use crate::context::{self, RunContext};
use crate::error::{EngineError, Result};
use crate::workspace::{allowlist_matches, parse_allowlist};
use beluga_graph::{Graph, NodeKind};

/// Statically reject dangerous tool command shapes
///
/// Rejection reasons (checked in order): a `~` anywhere, a `..` that is
/// a path-segment token, and any whitespace-separated token that starts
/// with `/` once surrounding quotes are stripped. `..` embedded inside a
/// larger word (Go's `./...`) is fine.
pub fn check_tool_command(command: &str) -> std::result::Result<(), String> {
    if command.contains('~') {
        return Err("tool command contains '~'".to_string());
    }
    if has_parent_segment(command) {
        return Err("tool command contains a '..' path segment".to_string());
    }
    for token in command.split_whitespace() {
        let stripped = strip_quotes(token);
        if stripped.starts_with('/') {
            return Err(format!(
                "tool command contains absolute path token '{stripped}'"
            ));
        }
    }
    Ok(())
}

/// True when the command contains `..` flanked by path separators or
/// shell boundary characters on both sides
fn has_parent_segment(command: &str) -> bool {
    let bytes = command.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'.' && bytes[i + 1] == b'.' {
            let before = if i == 0 { None } else { Some(bytes[i - 1]) };
            let after = bytes.get(i + 2).copied();
            if is_boundary(before) && is_boundary(after) {
                return true;
            }
        }
        i += 1;
    }
    false
}

fn is_boundary(byte: Option<u8>) -> bool {
    match byte {
        None => true,
        Some(b) => matches!(
            b,
            b' ' | b'\t' | b'/' | b'"' | b'\'' | b'=' | b':' | b';' | b'&' | b'|' | b'(' | b')'
        ),
    }
}

fn strip_quotes(token: &str) -> &str {
    token
        .trim_matches('"')
        .trim_matches('\'')
}

/// Shell-script path tokens referenced by a tool command
///
/// Returns whitespace-separated tokens ending in `.sh`, excluding flags
/// and environment assignments, with surrounding quotes stripped.
pub fn sh_script_tokens(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(strip_quotes)
        .filter(|token| !token.starts_with('-'))
        .filter(|token| !is_env_assignment(token))
        .filter(|token| token.ends_with(".sh"))
        .map(str::to_string)
        .collect()
}

fn is_env_assignment(token: &str) -> bool {
    let Some(eq) = token.find('=') else {
        return false;
    };
    let name = &token[..eq];
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
}

/// Abort before a codergen stage that cannot remediate the last failure
///
/// If the previous failure came from a tool node whose command runs
/// `*.sh` scripts, and any of those scripts falls outside the codergen
/// node's `allowed_write_paths`, there is no way for the fix stage to
/// change the failing input; the run stops here instead of looping.
pub fn check_unfixable_failure_source(
    graph: &Graph,
    context: &RunContext,
    current_node: &str,
) -> Result<()> {
    let Some(failed_id) = context.get_str(context::KEY_LAST_FAILURE_NODE_ID) else {
        return Ok(());
    };
    let Some(failed_node) = graph.node(failed_id) else {
        return Ok(());
    };
    if failed_node.kind() != NodeKind::Tool {
        return Ok(());
    }
    let Some(command) = failed_node.attrs.get_str("tool_command") else {
        return Ok(());
    };

    let scripts = sh_script_tokens(command);
    if scripts.is_empty() {
        return Ok(());
    }

    let allowlist = graph
        .node(current_node)
        .and_then(|n| n.attrs.get_str("allowed_write_paths"))
        .map(parse_allowlist)
        .unwrap_or_default();

    let uncovered: Vec<String> = scripts
        .into_iter()
        .filter(|script| !allowlist_matches(script, &allowlist))
        .collect();
    if uncovered.is_empty() {
        return Ok(());
    }

    tracing::warn!(
        failed_node = failed_id,
        current_node,
        paths = uncovered.join(",").as_str(),
        "aborting: failure source is outside the fix stage's write scope"
    );
    Err(EngineError::UnfixableFailureSource {
        failed_node: failed_id.to_string(),
        paths: uncovered.join(", "),
        current_node: current_node.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beluga_graph::parse_dot;
    use serde_json::json;

    #[test]
    fn tilde_is_rejected() {
        assert!(check_tool_command("cat ~/secrets").is_err());
    }

    #[test]
    fn parent_segment_is_rejected_but_ellipsis_is_not() {
        assert!(check_tool_command("cat ../x").is_err());
        assert!(check_tool_command("cd a/../b").is_err());
        assert!(check_tool_command("rm ..").is_err());
        assert!(check_tool_command("go test ./...").is_ok());
        assert!(check_tool_command("go build ./pkg/...").is_ok());
    }

    #[test]
    fn absolute_tokens_are_rejected_even_quoted() {
        assert!(check_tool_command("cat /etc/passwd").is_err());
        assert!(check_tool_command("cat \"/etc/passwd\"").is_err());
        assert!(check_tool_command("echo hi > out.txt").is_ok());
    }

    #[test]
    fn sh_tokens_skip_flags_and_env_assignments() {
        let tokens =
            sh_script_tokens("ENV=1 sh -x scripts/scenarios/foo.sh --skip=bad.sh other/run.sh");
        assert_eq!(tokens, vec!["scripts/scenarios/foo.sh", "other/run.sh"]);
    }

    fn graph_with_failed_tool(allowed: &str) -> Graph {
        parse_dot(&format!(
            r#"digraph G {{
                start [shape=Mdiamond]
                breaker [tool_command="sh scripts/scenarios/foo.sh"]
                fixer [allowed_write_paths="{allowed}"]
                exit [shape=Msquare]
                start -> breaker -> fixer -> exit
            }}"#
        ))
        .unwrap()
    }

    fn failed_context(node_id: &str) -> RunContext {
        let mut ctx = RunContext::new();
        ctx.set(context::KEY_LAST_FAILURE_NODE_ID, json!(node_id));
        ctx
    }

    #[test]
    fn unfixable_source_aborts() {
        let graph = graph_with_failed_tool("agent/");
        let ctx = failed_context("breaker");
        let err = check_unfixable_failure_source(&graph, &ctx, "fixer").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("unfixable_failure_source"));
        assert!(text.contains("scripts/scenarios/foo.sh"));
        assert!(text.contains("fixer"));
    }

    #[test]
    fn covered_script_is_fixable() {
        let graph = graph_with_failed_tool("scripts/");
        let ctx = failed_context("breaker");
        assert!(check_unfixable_failure_source(&graph, &ctx, "fixer").is_ok());
    }

    #[test]
    fn non_tool_failures_pass() {
        let graph = graph_with_failed_tool("agent/");
        let ctx = failed_context("fixer");
        assert!(check_unfixable_failure_source(&graph, &ctx, "fixer").is_ok());

        let empty = RunContext::new();
        assert!(check_unfixable_failure_source(&graph, &empty, "fixer").is_ok());
    }
}
