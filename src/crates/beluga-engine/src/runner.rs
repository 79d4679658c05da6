//! The pipeline runner: state machine, retry policy, persistence, resume
//!
//! One `PipelineRunner::run` call drives a validated graph from its
//! start node to an exit node, one stage at a time. Per visit the engine
//! snapshots the workspace, executes the handler (with the retry loop
//! inside the visit), diffs, enforces the write allowlist, persists the
//! stage artifacts, merges context, checkpoints, and routes.
//!
//! All terminal failures are emitted as `PipelineFailed` events before
//! the error is returned; everything already on disk plus the last
//! checkpoint is sufficient for a later resume.

use crate::checkpoint::Checkpoint;
use crate::config::RunConfig;
use crate::context::{self, ContextDelta, RunContext};
use crate::error::{EngineError, Result};
use crate::events::{timestamp_now, Event, EventLog};
use crate::feedback;
use crate::guardrail;
use crate::handlers;
use crate::outcome::{Outcome, StageRecord, SCHEMA_VERSION};
use crate::routing;
use crate::trace::{TraceLog, TraceRecord};
use crate::workspace::{self, HashCache, WorkspaceDiff};
use beluga_graph::{validate_or_raise, Graph, Node, NodeKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Pause between retry attempts of one stage
const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Run manifest written at workspace creation (`manifest.json`)
#[derive(Debug, Serialize)]
struct Manifest {
    schema_version: u32,
    pipeline_path: String,
    original_workdir: String,
    workspace_path: String,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<String>,
}

/// Summary of a successfully terminated run
#[derive(Debug)]
pub struct PipelineRunResult {
    /// Run identifier
    pub run_id: String,
    /// The run directory holding all artifacts
    pub run_dir: PathBuf,
    /// Completed node ids: checkpointed stages first (sorted, when the
    /// run was resumed), then this process's visits in execution order
    pub completed_nodes: Vec<String>,
    /// Final context snapshot
    pub context: BTreeMap<String, serde_json::Value>,
}

/// Drives pipeline graphs to completion
#[derive(Debug)]
pub struct PipelineRunner {
    config: RunConfig,
}

/// Everything the per-stage loop threads along
struct RunState {
    run_id: String,
    run_dir: PathBuf,
    workspace: PathBuf,
    context: RunContext,
    completed: Vec<String>,
    retry_counts: BTreeMap<String, u64>,
    node_outcomes: BTreeMap<String, Outcome>,
    events: EventLog,
    trace: TraceLog,
    cache: HashCache,
}

impl PipelineRunner {
    /// Build a runner over the given configuration
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Execute (or resume) a run of `graph`
    ///
    /// `pipeline_path` is recorded in the manifest for audit; it is not
    /// re-read.
    pub async fn run(&self, graph: &Graph, pipeline_path: &Path) -> Result<PipelineRunResult> {
        validate_or_raise(graph)?;

        let run_id = self
            .config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", graph.id, Uuid::new_v4()));
        let run_dir = self.config.runs_root.join(&run_id);
        let workspace = run_dir.join("workspace");
        fs::create_dir_all(&run_dir)?;

        let resumed = if self.config.resume {
            Some(Checkpoint::load(&run_dir.join("checkpoint.json"))?)
        } else {
            None
        };

        if resumed.is_none() {
            workspace::prepare_workspace(&self.config.source_dir, &workspace, &self.config.runs_root)?;
            let manifest = Manifest {
                schema_version: SCHEMA_VERSION,
                pipeline_path: pipeline_path.to_string_lossy().to_string(),
                original_workdir: std::env::current_dir()
                    .map(|d| d.to_string_lossy().to_string())
                    .unwrap_or_default(),
                workspace_path: workspace.to_string_lossy().to_string(),
                started_at: timestamp_now(),
                goal: graph.goal().map(str::to_string),
            };
            fs::write(
                run_dir.join("manifest.json"),
                serde_json::to_vec_pretty(&manifest)?,
            )?;
        }

        let mut events = EventLog::open(&run_dir.join("events.jsonl"))?;
        let mut trace = TraceLog::open(&run_dir.join("trace.jsonl"))?;
        trace.append(&TraceRecord::SessionInitialized {
            run_id: run_id.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: TraceLog::stamp(),
        })?;

        let (context, completed, retry_counts, first_node) = match &resumed {
            Some(checkpoint) => {
                trace.append(&TraceRecord::ResumeLoaded {
                    run_id: run_id.clone(),
                    last_completed_node: checkpoint.last_completed_node.clone(),
                    timestamp: TraceLog::stamp(),
                })?;
                let context = RunContext::from_values(checkpoint.context.clone());
                let successor = resume_successor(graph, checkpoint, &context)?;
                (
                    context,
                    checkpoint.completed_nodes.clone(),
                    checkpoint.retry_counts.clone(),
                    successor,
                )
            }
            None => {
                let context = RunContext::from_values(graph.context_seed());
                let start = graph
                    .start_node()
                    .ok_or_else(|| EngineError::Protocol("validated graph lost its start node".into()))?;
                (context, Vec::new(), BTreeMap::new(), Some(start.id.clone()))
            }
        };

        events.append(&Event::PipelineStarted {
            run_id: run_id.clone(),
            pipeline: graph.id.clone(),
            timestamp: timestamp_now(),
        })?;
        trace.append(&TraceRecord::PipelineStarted {
            run_id: run_id.clone(),
            pipeline: graph.id.clone(),
            timestamp: TraceLog::stamp(),
        })?;

        // Resumed nodes count as successes for requires_tool_success checks.
        let node_outcomes: BTreeMap<String, Outcome> = completed
            .iter()
            .map(|id| (id.clone(), Outcome::Success))
            .collect();

        let mut state = RunState {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            workspace,
            context,
            completed,
            retry_counts,
            node_outcomes,
            events,
            trace,
            cache: HashCache::default(),
        };

        let outcome = match first_node {
            // A resumed checkpoint whose last node was an exit: nothing left to do.
            None => Ok(()),
            Some(first) => self.drive(graph, &mut state, first).await,
        };

        match outcome {
            Ok(()) => {
                state.events.append(&Event::PipelineCompleted {
                    run_id: run_id.clone(),
                    timestamp: timestamp_now(),
                })?;
                state.trace.append(&TraceRecord::PipelineCompleted {
                    run_id: run_id.clone(),
                    timestamp: TraceLog::stamp(),
                })?;
                tracing::info!(run_id = run_id.as_str(), "pipeline completed");
                Ok(PipelineRunResult {
                    run_id,
                    run_dir,
                    completed_nodes: state.completed,
                    context: state.context.snapshot(),
                })
            }
            Err(err) => {
                let message = err.to_string();
                state.events.append(&Event::PipelineFailed {
                    run_id: run_id.clone(),
                    error: message.clone(),
                    timestamp: timestamp_now(),
                })?;
                state.trace.append(&TraceRecord::PipelineFailed {
                    run_id: run_id.clone(),
                    error: message.clone(),
                    timestamp: TraceLog::stamp(),
                })?;
                tracing::error!(run_id = run_id.as_str(), error = message.as_str(), "pipeline failed");
                Err(err)
            }
        }
    }

    /// The per-stage loop
    async fn drive(&self, graph: &Graph, state: &mut RunState, first_node: String) -> Result<()> {
        let mut current = first_node;
        loop {
            let node = graph.node(&current).ok_or_else(|| {
                EngineError::Protocol(format!("traversal reached unknown node '{current}'"))
            })?;

            let record = self.visit(graph, state, node).await?;
            state.completed.push(node.id.clone());
            state.node_outcomes.insert(node.id.clone(), record.outcome);

            let checkpoint = Checkpoint::new(
                state.run_id.clone(),
                node.id.clone(),
                state.completed.clone(),
                state.retry_counts.clone(),
                state.context.snapshot(),
            );
            checkpoint.save(&state.run_dir.join("checkpoint.json"))?;
            state.events.append(&Event::CheckpointSaved {
                node_id: node.id.clone(),
                timestamp: timestamp_now(),
            })?;

            if self.config.stop_after_node.as_deref() == Some(node.id.as_str()) {
                return Err(EngineError::StoppedForTest {
                    node: node.id.clone(),
                });
            }

            if node.is_exit() {
                return Ok(());
            }

            let decision = routing::select_next_edge(graph, &node.id, record.outcome);
            state.trace.append(&TraceRecord::RouteEvaluated {
                node_id: node.id.clone(),
                outcome: record.outcome.as_str().to_string(),
                edges: decision.evaluated,
                selected: decision.selected.clone(),
                timestamp: TraceLog::stamp(),
            })?;
            match decision.selected {
                Some(next) => {
                    tracing::debug!(
                        from = node.id.as_str(),
                        to = next.as_str(),
                        outcome = record.outcome.as_str(),
                        "routed to next stage"
                    );
                    current = next;
                }
                None => {
                    return Err(EngineError::NoRoute {
                        node: node.id.clone(),
                        outcome: record.outcome.as_str().to_string(),
                    });
                }
            }
        }
    }

    /// One node visit: steps 1 through 13 of the stage lifecycle
    async fn visit(&self, graph: &Graph, state: &mut RunState, node: &Node) -> Result<StageRecord> {
        let artifact_dir = state.run_dir.join(&node.id);
        fs::create_dir_all(&artifact_dir)?;

        state.context.set(context::KEY_CURRENT_NODE, serde_json::json!(node.id));
        let context_before = state.context.snapshot();

        tracing::info!(node_id = node.id.as_str(), kind = node.kind().as_str(), "stage started");
        state.events.append(&Event::StageStarted {
            node_id: node.id.clone(),
            timestamp: timestamp_now(),
        })?;
        state.trace.append(&TraceRecord::NodeInputCaptured {
            node_id: node.id.clone(),
            context: context_before.clone(),
            attributes: node
                .attrs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            artifact_dir: artifact_dir.to_string_lossy().to_string(),
            timestamp: TraceLog::stamp(),
        })?;

        let snapshot_before = workspace::snapshot(&state.workspace, &mut state.cache)?;

        if node.kind() == NodeKind::Codergen {
            guardrail::check_unfixable_failure_source(graph, &state.context, &node.id)?;
        }

        let mut record = self
            .execute_with_retries(graph, state, node, &artifact_dir)
            .await?;

        if node.kind() == NodeKind::Codergen
            && node.attrs.get_bool("requires_tool_success") == Some(true)
        {
            if let Some(required) = node.attrs.get_str("required_tool_node") {
                let satisfied = state
                    .node_outcomes
                    .get(required)
                    .map(Outcome::is_success_like)
                    .unwrap_or(false);
                if !satisfied {
                    record = StageRecord::fail(format!(
                        "required tool node '{required}' has not completed successfully"
                    ));
                }
            }
        }

        let snapshot_after = workspace::snapshot(&state.workspace, &mut state.cache)?;
        let diff = WorkspaceDiff::between(&snapshot_before, &snapshot_after);
        fs::write(
            artifact_dir.join("workspace.diff.json"),
            serde_json::to_vec_pretty(&diff)?,
        )?;

        if matches!(node.kind(), NodeKind::Tool | NodeKind::Codergen) {
            if let Some(raw) = node.attrs.get_str("allowed_write_paths") {
                let entries = workspace::parse_allowlist(raw);
                if !entries.is_empty() {
                    let violations = workspace::disallowed_paths(&diff, &entries);
                    if !violations.is_empty() {
                        let detail = violations.join(", ");
                        tracing::warn!(
                            node_id = node.id.as_str(),
                            files = detail.as_str(),
                            "write allowlist violation"
                        );
                        record.outcome = Outcome::Fail;
                        record.failure_reason = Some(format!(
                            "guardrail_violation: wrote disallowed files: {detail}"
                        ));
                        state.events.append(&Event::GuardrailViolation {
                            node_id: node.id.clone(),
                            detail,
                            timestamp: timestamp_now(),
                        })?;
                    }
                }
            }
        }

        // Retry exhaustion: the attempt loop has already run out.
        if record.outcome == Outcome::Retry {
            if node.attrs.get_bool("allow_partial") == Some(true) {
                record.outcome = Outcome::PartialSuccess;
            } else {
                record.outcome = Outcome::Fail;
                if record.failure_reason.is_none() {
                    record.failure_reason = Some("retry_exhausted".to_string());
                }
            }
        }

        fs::write(
            artifact_dir.join("status.json"),
            serde_json::to_vec_pretty(&record)?,
        )?;

        if record.outcome == Outcome::Fail {
            state.events.append(&Event::StageFailed {
                node_id: node.id.clone(),
                reason: record.reason().to_string(),
                timestamp: timestamp_now(),
            })?;
        } else {
            state.events.append(&Event::StageCompleted {
                node_id: node.id.clone(),
                outcome: record.outcome.as_str().to_string(),
                timestamp: timestamp_now(),
            })?;
        }

        state.context.merge(&record.context_updates);
        state
            .context
            .set(context::KEY_OUTCOME, serde_json::json!(record.outcome.as_str()));

        if record.outcome == Outcome::Fail {
            let updates = feedback::synthesize(
                &node.id,
                node.kind().as_str(),
                record.reason(),
                &artifact_dir,
            );
            state.context.merge(&updates);
        }

        let delta = ContextDelta::between(&context_before, &state.context.snapshot());
        state.trace.append(&TraceRecord::NodeOutputCaptured {
            node_id: node.id.clone(),
            outcome: record.outcome.as_str().to_string(),
            context_delta: delta,
            timestamp: TraceLog::stamp(),
        })?;

        Ok(record)
    }

    /// Run the handler, honoring `max_retries` with 500 ms pauses
    async fn execute_with_retries(
        &self,
        graph: &Graph,
        state: &mut RunState,
        node: &Node,
        artifact_dir: &Path,
    ) -> Result<StageRecord> {
        let max_retries = node.attrs.get_i64("max_retries").unwrap_or(0).max(0) as u64;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let result = handlers::execute_node(
                graph,
                node,
                &state.context,
                &state.workspace,
                artifact_dir,
                &self.config.backend,
            )
            .await;

            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    state.trace.append(&TraceRecord::NodeExecutionErrored {
                        node_id: node.id.clone(),
                        error: err.to_string(),
                        timestamp: TraceLog::stamp(),
                    })?;
                    return Err(err);
                }
            };

            if record.outcome == Outcome::Retry && attempt <= max_retries {
                let count = state.context.increment(&context::retry_count_key(&node.id));
                state.retry_counts.insert(node.id.clone(), count);
                state.events.append(&Event::StageRetrying {
                    node_id: node.id.clone(),
                    attempt: attempt as u32,
                    timestamp: timestamp_now(),
                })?;
                tracing::info!(
                    node_id = node.id.as_str(),
                    attempt,
                    max_attempts = max_retries + 1,
                    "stage requested retry"
                );
                tokio::time::sleep(RETRY_SLEEP).await;
                continue;
            }

            return Ok(record);
        }
    }
}

/// On resume, find the node to execute next
///
/// The successor of the checkpointed last-completed node under its
/// recorded outcome. Returns `None` when that node is an exit (the run
/// already finished); errors when no edge matches and it is not an
/// exit.
fn resume_successor(
    graph: &Graph,
    checkpoint: &Checkpoint,
    context: &RunContext,
) -> Result<Option<String>> {
    let last = &checkpoint.last_completed_node;
    let is_exit = graph.node(last).map(Node::is_exit).unwrap_or(false);
    if is_exit {
        return Ok(None);
    }

    let tag = context.get_str(context::KEY_OUTCOME).unwrap_or("success");
    let outcome = Outcome::parse(tag).ok_or_else(|| {
        EngineError::Protocol(format!("checkpoint context has unknown outcome '{tag}'"))
    })?;

    match routing::select_next_edge(graph, last, outcome).selected {
        Some(next) => Ok(Some(next)),
        None => Err(EngineError::ResumeMismatch {
            node: last.clone(),
            outcome: outcome.as_str().to_string(),
        }),
    }
}
