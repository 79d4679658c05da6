//! Stage handlers
//!
//! The handler set is closed — start, exit, tool, verification,
//! codergen — so dispatch is a match on [`NodeKind`] rather than a
//! registry of trait objects. Start and exit are structural no-ops;
//! verification lives in [`crate::verification`]; this module owns the
//! tool handler and the codergen handler (prompt assembly, prompt
//! decorations, deterministic test mode, agent dispatch).

use crate::config::AgentBackend;
use crate::context::{self, RunContext};
use crate::error::{EngineError, Result};
use crate::guardrail;
use crate::outcome::{Outcome, StageRecord};
use crate::verification;
use beluga_agent::{Agent, AgentRequest, ExternalProcessAgent, StubAgent};
use beluga_graph::{Graph, Node, NodeKind};
use std::collections::VecDeque;
use std::path::Path;

/// Execute one node visit via its derived handler
pub async fn execute_node(
    graph: &Graph,
    node: &Node,
    ctx: &RunContext,
    workspace: &Path,
    artifact_dir: &Path,
    backend: &AgentBackend,
) -> Result<StageRecord> {
    match node.kind() {
        NodeKind::Start | NodeKind::Exit => Ok(StageRecord::success()),
        NodeKind::Tool => execute_tool(node, workspace, artifact_dir).await,
        NodeKind::Verification => {
            verification::run_verification(node, ctx, workspace, artifact_dir).await
        }
        NodeKind::Codergen => {
            execute_codergen(graph, node, ctx, workspace, artifact_dir, backend).await
        }
    }
}

/// Tool handler: one shell command relative to the workspace
async fn execute_tool(node: &Node, workspace: &Path, artifact_dir: &Path) -> Result<StageRecord> {
    let Some(command) = node.attrs.get_str("tool_command") else {
        return Ok(StageRecord::fail("tool node is missing the tool_command attribute"));
    };

    if let Err(reason) = guardrail::check_tool_command(command) {
        tracing::warn!(node_id = node.id.as_str(), reason = reason.as_str(), "tool command rejected");
        return Ok(StageRecord::fail(format!("tool command rejected: {reason}")));
    }

    tracing::info!(node_id = node.id.as_str(), command, "running tool command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .output()
        .await?;

    let exit_code = output.status.code().unwrap_or(-1);
    std::fs::write(artifact_dir.join("tool.stdout.txt"), &output.stdout)?;
    std::fs::write(artifact_dir.join("tool.stderr.txt"), &output.stderr)?;
    std::fs::write(artifact_dir.join("tool.exitcode.txt"), exit_code.to_string())?;

    Ok(if exit_code == 0 {
        StageRecord::success()
    } else {
        StageRecord::fail(format!("tool_exit_code_{exit_code}"))
    })
}

/// Codergen handler: assemble the prompt, then ask the backend
async fn execute_codergen(
    graph: &Graph,
    node: &Node,
    ctx: &RunContext,
    workspace: &Path,
    artifact_dir: &Path,
    backend: &AgentBackend,
) -> Result<StageRecord> {
    let prompt = assemble_prompt(graph, node, ctx);
    std::fs::write(artifact_dir.join("prompt.md"), &prompt)?;

    if let AgentBackend::TestFake = backend {
        let record = test_fake_record(node, ctx)?;
        std::fs::write(
            artifact_dir.join("response.md"),
            serde_json::to_vec_pretty(&record)?,
        )?;
        return Ok(record);
    }

    let request = AgentRequest {
        prompt: &prompt,
        node_id: &node.id,
        artifact_dir,
        workspace,
    };
    let reply = match backend {
        AgentBackend::Stub => StubAgent.run(request).await?,
        AgentBackend::External(config) => {
            ExternalProcessAgent::new(config.clone()).run(request).await?
        }
        AgentBackend::TestFake => unreachable!("handled above"),
    };

    let response_path = artifact_dir.join("response.md");
    if !response_path.exists() {
        std::fs::write(&response_path, serde_json::to_vec_pretty(&reply)?)?;
    }

    let outcome = Outcome::parse(&reply.outcome).ok_or_else(|| {
        EngineError::Protocol(format!(
            "agent for node '{}' returned unknown outcome '{}'",
            node.id, reply.outcome
        ))
    })?;
    let mut record = StageRecord::new(outcome);
    record.preferred_next = reply.preferred_next;
    record.suggested_next_ids = reply.suggested_next_ids;
    record.context_updates = reply.context_updates;
    record.notes = reply.notes;
    record.failure_reason = reply.failure_reason;
    Ok(record)
}

/// Build the full prompt text for a codergen node
///
/// Base text is the `prompt` attribute (falling back to the label) with
/// `$goal` substituted. Two decorations follow unconditionally when
/// their data exists: failure feedback from the last failed stage, and
/// the command allowlist of the verification stage downstream of this
/// node.
pub fn assemble_prompt(graph: &Graph, node: &Node, ctx: &RunContext) -> String {
    let base = node.attrs.get_str("prompt").unwrap_or_else(|| node.label());
    let goal = graph.goal().unwrap_or("");
    let mut prompt = base.replace("$goal", goal);

    if let Some(summary) = ctx.get_str(context::KEY_LAST_FAILURE_SUMMARY) {
        if !summary.is_empty() {
            let failed_node = ctx
                .get_str(context::KEY_LAST_FAILURE_NODE_ID)
                .unwrap_or("unknown");
            let reason = ctx
                .get_str(context::KEY_LAST_FAILURE_REASON)
                .unwrap_or("unknown");
            prompt.push_str(&format!(
                "\n\n## Failure feedback\n\nPrevious stage '{failed_node}' failed ({reason}).\n\n{summary}\n"
            ));
        }
    }

    if let Some(allowed) = verification_allowlist_for(graph, node) {
        prompt.push_str("\n\n## Verification plan command allowlist\n\n");
        for entry in allowed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            prompt.push_str(&format!("- {entry}\n"));
        }
    }

    prompt
}

/// Command allowlist that will judge this node's verification plan
///
/// An explicit `verification.allowed_commands` attribute on the node
/// wins; otherwise the first verification node reachable by forward
/// edge traversal supplies its allowlist.
fn verification_allowlist_for(graph: &Graph, node: &Node) -> Option<String> {
    if let Some(explicit) = node.attrs.get_str("verification.allowed_commands") {
        return Some(explicit.to_string());
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut seen = vec![node.id.as_str()];
    queue.push_back(&node.id);
    while let Some(current) = queue.pop_front() {
        for edge in graph.outgoing_edges(current) {
            let Some(target) = graph.node(&edge.to) else {
                continue;
            };
            if seen.contains(&target.id.as_str()) {
                continue;
            }
            seen.push(&target.id);
            if target.kind() == NodeKind::Verification {
                return target
                    .attrs
                    .get_str("verification.allowed_commands")
                    .map(str::to_string);
            }
            queue.push_back(&target.id);
        }
    }
    None
}

/// Deterministic test mode: outcome fields from `test.*` attributes
///
/// `test.outcome_sequence` yields one tag per attempt (indexed by the
/// node's retry counter, clamped to the last entry), so retry behavior
/// can be exercised without a real backend; `test.outcome` is the
/// constant form.
fn test_fake_record(node: &Node, ctx: &RunContext) -> Result<StageRecord> {
    let sequence_tag = node.attrs.get_str("test.outcome_sequence").and_then(|raw| {
        let tags: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        if tags.is_empty() {
            return None;
        }
        let attempt = ctx
            .get_u64(&context::retry_count_key(&node.id))
            .unwrap_or(0) as usize;
        Some(tags[attempt.min(tags.len() - 1)].to_string())
    });
    let tag = sequence_tag
        .as_deref()
        .or_else(|| node.attrs.get_str("test.outcome"))
        .unwrap_or("success");
    let outcome = Outcome::parse(tag).ok_or_else(|| {
        EngineError::Protocol(format!(
            "node '{}' has unknown test.outcome '{tag}'",
            node.id
        ))
    })?;

    let mut record = StageRecord::new(outcome);
    record.notes = node.attrs.get_str("test.notes").map(str::to_string);
    record.failure_reason = node
        .attrs
        .get_str("test.failure_reason")
        .map(str::to_string);
    record.preferred_next = node
        .attrs
        .get_str("test.preferred_next")
        .map(str::to_string);
    if let Some(ids) = node.attrs.get_str("test.suggested_next_ids") {
        record.suggested_next_ids = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(raw) = node.attrs.get_str("test.context_updates_json") {
        let updates: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            EngineError::Protocol(format!(
                "node '{}' has invalid test.context_updates_json: {e}",
                node.id
            ))
        })?;
        if let Some(map) = updates.as_object() {
            for (k, v) in map {
                record.context_updates.insert(k.clone(), v.clone());
            }
        }
    }
    if let Some(raw) = node.attrs.get_str("test.verification_plan_json") {
        let plan: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            EngineError::Protocol(format!(
                "node '{}' has invalid test.verification_plan_json: {e}",
                node.id
            ))
        })?;
        let key = node
            .attrs
            .get_str("verification.plan_context_key")
            .unwrap_or(context::KEY_VERIFICATION_PLAN);
        record.context_updates.insert(key.to_string(), plan);
    }
    Ok(record)
}
