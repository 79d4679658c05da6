//! End-to-end pipeline scenarios
//!
//! Each test drives a real run directory on disk: parse a pipeline,
//! run it with the stub or deterministic-fake backend, then assert on
//! the artifacts the run left behind (events, status files, checkpoint,
//! workspace diffs).

use beluga_engine::events::read_events;
use beluga_engine::{
    Checkpoint, EngineError, Event, Outcome, PipelineRunner, RunConfig, StageRecord,
};
use beluga_graph::parse_dot;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Source tree + runs root for one test
struct Fixture {
    _tmp: TempDir,
    source: PathBuf,
    runs: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("project");
    let runs = tmp.path().join("runs");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&runs).unwrap();
    Fixture {
        _tmp: tmp,
        source,
        runs,
    }
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn status_of(run_dir: &Path, node: &str) -> StageRecord {
    let text = fs::read_to_string(run_dir.join(node).join("status.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn event_kinds(run_dir: &Path) -> Vec<String> {
    read_events(&run_dir.join("events.jsonl"))
        .unwrap()
        .iter()
        .map(|e| e.kind().to_string())
        .collect()
}

// ============================================================================
// Scenario 1: linear run
// ============================================================================

#[tokio::test]
async fn linear_run_completes_with_artifacts() -> anyhow::Result<()> {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph demo {
            start [shape=Mdiamond]
            a
            exit [shape=Msquare]
            start -> a -> exit
        }"#,
    )?;

    let runner = PipelineRunner::new(RunConfig::new(&fx.source, &fx.runs).with_run_id("linear"));
    let result = runner.run(&graph, Path::new("demo.dot")).await?;

    assert_eq!(result.completed_nodes, vec!["start", "a", "exit"]);

    let run_dir = &result.run_dir;
    let kinds = event_kinds(run_dir);
    assert!(kinds.contains(&"pipeline_started".to_string()));
    assert!(kinds.contains(&"pipeline_completed".to_string()));

    let status = status_of(run_dir, "a");
    assert_eq!(status.outcome, Outcome::Success);

    let checkpoint = Checkpoint::load(&run_dir.join("checkpoint.json"))?;
    assert_eq!(checkpoint.last_completed_node, "exit");
    assert_eq!(checkpoint.completed_nodes, vec!["a", "exit", "start"]);

    assert!(run_dir.join("manifest.json").exists());
    assert!(run_dir.join("trace.jsonl").exists());
    assert!(run_dir.join("workspace").is_dir());
    Ok(())
}

// ============================================================================
// Scenario 2: write-allowlist violation
// ============================================================================

#[tokio::test]
async fn allowlist_violation_fails_stage_and_emits_event() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            t [tool_command="sh -c 'echo hi > b.txt'", allowed_write_paths="a.txt"]
            exit [shape=Msquare]
            start -> t -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(RunConfig::new(&fx.source, &fx.runs).with_run_id("allow"));
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let status = status_of(&result.run_dir, "t");
    assert_eq!(status.outcome, Outcome::Fail);
    assert_eq!(
        status.failure_reason.as_deref(),
        Some("guardrail_violation: wrote disallowed files: b.txt")
    );

    let events = read_events(&result.run_dir.join("events.jsonl")).unwrap();
    let violation = events
        .iter()
        .find_map(|e| match e {
            Event::GuardrailViolation { node_id, detail, .. } => Some((node_id, detail)),
            _ => None,
        })
        .expect("guardrail violation event");
    assert_eq!(violation.0, "t");
    assert!(violation.1.contains("b.txt"));
}

// ============================================================================
// Scenario 3: outcome routing
// ============================================================================

#[tokio::test]
async fn fail_outcome_routes_to_fail_edge() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            a [test.outcome="fail", test.failure_reason="forced"]
            exit_fail [shape=Msquare]
            exit_ok [shape=Msquare]
            start -> a
            a -> exit_fail [condition="outcome=fail"]
            a -> exit_ok [condition="outcome=success"]
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("routing"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    assert!(result.run_dir.join("exit_fail/status.json").exists());
    assert!(!result.run_dir.join("exit_ok").exists());
}

// ============================================================================
// Scenario 4: retry then success
// ============================================================================

#[tokio::test]
async fn retry_twice_then_succeed() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            a [max_retries=2, test.outcome_sequence="retry,retry,success"]
            exit [shape=Msquare]
            start -> a -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("retry"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let events = read_events(&result.run_dir.join("events.jsonl")).unwrap();
    let retrying: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e, Event::StageRetrying { node_id, .. } if node_id == "a"))
        .collect();
    assert_eq!(retrying.len(), 2);

    let completed: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e, Event::StageCompleted { node_id, .. } if node_id == "a"))
        .collect();
    assert_eq!(completed.len(), 1);

    assert_eq!(status_of(&result.run_dir, "a").outcome, Outcome::Success);

    let checkpoint = Checkpoint::load(&result.run_dir.join("checkpoint.json")).unwrap();
    assert_eq!(checkpoint.retry_counts.get("a"), Some(&2));
}

// ============================================================================
// Scenario 5: verification with an env-prefixed command
// ============================================================================

#[tokio::test]
async fn verification_runs_env_prefixed_command_without_shell() {
    let fx = fixture();
    write(&fx.source.join("go.mod"), "module demo\n");
    write(&fx.source.join("main.go"), "package main\nfunc main() {}\n");

    // `env` stands in for the go toolchain: same env-assignment-prefix
    // shape, guaranteed to exist. The plan is injected by the planning
    // stage via test.verification_plan_json.
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            plan [test.verification_plan_json="{\"files\": [\"go.mod\", \"main.go\"], \"commands\": [\"GOCACHE=\\\"$PWD/.gocache\\\" env\"]}"]
            verify [type=verification, verification.allowed_commands="env,go test"]
            exit [shape=Msquare]
            start -> plan -> verify -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("verify"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    assert_eq!(status_of(&result.run_dir, "verify").outcome, Outcome::Success);

    let results: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(result.run_dir.join("verify/verification.results.json")).unwrap(),
    )
    .unwrap();
    // Original command text, exit 0, and the expanded PWD visible to the child.
    assert_eq!(results[0]["command"], "GOCACHE=\"$PWD/.gocache\" env");
    assert_eq!(results[0]["exit_code"], 0);
    assert!(results[0]["stdout"]
        .as_str()
        .unwrap()
        .contains("/.gocache"));

    assert!(result.run_dir.join("verify/verification.plan.json").exists());
}

// ============================================================================
// Scenario 6: unfixable failure source
// ============================================================================

#[tokio::test]
async fn unfixable_failure_source_aborts_before_fix_stage() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            breaker [tool_command="sh scripts/scenarios/foo.sh"]
            fixer [allowed_write_paths="agent/", prompt="fix it"]
            exit [shape=Msquare]
            start -> breaker
            breaker -> fixer [condition="outcome=fail"]
            breaker -> exit [condition="outcome=success"]
            fixer -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("unfixable"),
    );
    let err = runner.run(&graph, Path::new("p.dot")).await.unwrap_err();
    assert!(err.to_string().contains("unfixable_failure_source"));
    assert!(err.to_string().contains("scripts/scenarios/foo.sh"));

    // The guard fired before the fix handler produced any side effects.
    let run_dir = fx.runs.join("unfixable");
    assert!(!run_dir.join("fixer/prompt.md").exists());
    assert!(!run_dir.join("fixer/status.json").exists());

    let kinds = event_kinds(&run_dir);
    assert!(kinds.contains(&"pipeline_failed".to_string()));
}

// ============================================================================
// Retry boundaries
// ============================================================================

#[tokio::test]
async fn max_retries_zero_executes_exactly_once() {
    let fx = fixture();
    // The tool appends a line per execution; retry outcome never fires
    // for tools, so this checks the single-attempt default path.
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            t [tool_command="echo ran >> count.txt"]
            exit [shape=Msquare]
            start -> t -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(RunConfig::new(&fx.source, &fx.runs).with_run_id("once"));
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let count = fs::read_to_string(result.run_dir.join("workspace/count.txt")).unwrap();
    assert_eq!(count.lines().count(), 1);
}

#[tokio::test]
async fn retry_without_budget_demotes_to_fail() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            a [test.outcome="retry"]
            fallback
            exit [shape=Msquare]
            start -> a
            a -> fallback [condition="outcome=fail"]
            a -> exit [condition="outcome=success"]
            fallback -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("demote"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let status = status_of(&result.run_dir, "a");
    assert_eq!(status.outcome, Outcome::Fail);
    assert_eq!(status.failure_reason.as_deref(), Some("retry_exhausted"));
    assert!(result.run_dir.join("fallback/status.json").exists());
}

#[tokio::test]
async fn exhausted_retries_with_allow_partial_promote() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            a [max_retries=1, allow_partial=true, test.outcome="retry"]
            exit [shape=Msquare]
            start -> a -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("partial"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let status = status_of(&result.run_dir, "a");
    assert_eq!(status.outcome, Outcome::PartialSuccess);
}

// ============================================================================
// Routing failure
// ============================================================================

#[tokio::test]
async fn missing_route_names_node_and_outcome() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            a [test.outcome="fail", test.failure_reason="forced"]
            exit [shape=Msquare]
            start -> a
            a -> exit [condition="outcome=success"]
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("noroute"),
    );
    let err = runner.run(&graph, Path::new("p.dot")).await.unwrap_err();
    assert!(matches!(err, EngineError::NoRoute { .. }));
    assert_eq!(
        err.to_string(),
        "no route from node a for outcome fail"
    );
}

// ============================================================================
// Failure feedback
// ============================================================================

#[tokio::test]
async fn failure_feedback_reaches_next_codergen_prompt() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            breaker [tool_command="sh -c 'echo boom-marker 1>&2; exit 2'"]
            helper [prompt="Please fix the build."]
            exit [shape=Msquare]
            start -> breaker
            breaker -> helper [condition="outcome=fail"]
            breaker -> exit [condition="outcome=success"]
            helper -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("feedback"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    // last_failure.* keys were set before the helper stage ran, and the
    // prompt decoration picked them up.
    let prompt = fs::read_to_string(result.run_dir.join("helper/prompt.md")).unwrap();
    assert!(prompt.contains("## Failure feedback"));
    assert!(prompt.contains("'breaker' failed (tool_exit_code_2)"));
    assert!(prompt.contains("boom-marker"));

    assert_eq!(
        result.context.get("last_failure.node_id"),
        Some(&serde_json::json!("breaker"))
    );
}

// ============================================================================
// Checkpoint / resume
// ============================================================================

#[tokio::test]
async fn stop_hook_then_resume_completes_the_run() {
    let fx = fixture();
    write(&fx.source.join("data.txt"), "seed");
    let source_graph = r#"digraph G {
            start [shape=Mdiamond]
            one [tool_command="echo one >> progress.txt"]
            two [tool_command="echo two >> progress.txt"]
            exit [shape=Msquare]
            start -> one -> two -> exit
        }"#;
    let graph = parse_dot(source_graph).unwrap();

    let mut config = RunConfig::new(&fx.source, &fx.runs).with_run_id("resumable");
    config.stop_after_node = Some("one".to_string());
    let err = PipelineRunner::new(config)
        .run(&graph, Path::new("p.dot"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StoppedForTest { .. }));

    let run_dir = fx.runs.join("resumable");
    let checkpoint = Checkpoint::load(&run_dir.join("checkpoint.json")).unwrap();
    assert_eq!(checkpoint.last_completed_node, "one");
    assert!(!run_dir.join("two").exists());

    // Resume from the checkpoint; node `one` must not run again.
    let mut config = RunConfig::new(&fx.source, &fx.runs).with_run_id("resumable");
    config.resume = true;
    config.stop_after_node = None;
    let result = PipelineRunner::new(config)
        .run(&graph, Path::new("p.dot"))
        .await
        .unwrap();

    // Checkpointed stages plus the two executed after the resume.
    assert_eq!(result.completed_nodes, vec!["one", "start", "two", "exit"]);
    let progress = fs::read_to_string(run_dir.join("workspace/progress.txt")).unwrap();
    assert_eq!(progress, "one\ntwo\n");
    // Workspace seeded at run start survived the resume untouched.
    assert_eq!(
        fs::read_to_string(run_dir.join("workspace/data.txt")).unwrap(),
        "seed"
    );

    let checkpoint = Checkpoint::load(&run_dir.join("checkpoint.json")).unwrap();
    assert_eq!(checkpoint.last_completed_node, "exit");
    assert_eq!(
        checkpoint.completed_nodes,
        vec!["exit", "one", "start", "two"]
    );
}

#[tokio::test]
async fn resume_mismatch_is_a_terminal_error() {
    let fx = fixture();
    // First run stops after `gate`, which failed; the edited graph the
    // resume uses has no fail edge out of `gate` and gate is not exit.
    let first = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            gate [test.outcome="fail", test.failure_reason="forced"]
            rescue
            exit [shape=Msquare]
            start -> gate
            gate -> rescue [condition="outcome=fail"]
            gate -> exit [condition="outcome=success"]
            rescue -> exit
        }"#,
    )
    .unwrap();

    let mut config = RunConfig::new(&fx.source, &fx.runs)
        .with_test_backend()
        .with_run_id("mismatch");
    config.stop_after_node = Some("gate".to_string());
    let err = PipelineRunner::new(config)
        .run(&first, Path::new("p.dot"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StoppedForTest { .. }));

    let second = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            gate
            exit [shape=Msquare]
            start -> gate
            gate -> exit [condition="outcome=success"]
        }"#,
    )
    .unwrap();
    let mut config = RunConfig::new(&fx.source, &fx.runs)
        .with_test_backend()
        .with_run_id("mismatch");
    config.resume = true;
    config.stop_after_node = None;
    let err = PipelineRunner::new(config)
        .run(&second, Path::new("p.dot"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResumeMismatch { .. }));
}

// ============================================================================
// Workspace diff artifacts
// ============================================================================

#[tokio::test]
async fn workspace_diff_records_tool_writes() {
    let fx = fixture();
    write(&fx.source.join("existing.txt"), "old");
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            t [tool_command="sh -c 'echo new > created.txt; echo changed > existing.txt'"]
            exit [shape=Msquare]
            start -> t -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(RunConfig::new(&fx.source, &fx.runs).with_run_id("diff"));
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let diff: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(result.run_dir.join("t/workspace.diff.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(diff["created"], serde_json::json!(["created.txt"]));
    assert_eq!(diff["modified"], serde_json::json!(["existing.txt"]));
    assert_eq!(diff["deleted"], serde_json::json!([]));

    // Start and exit stages touch nothing.
    let start_diff: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(result.run_dir.join("start/workspace.diff.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(start_diff["created"], serde_json::json!([]));
}

// ============================================================================
// requires_tool_success
// ============================================================================

#[tokio::test]
async fn codergen_requiring_failed_tool_is_coerced_to_fail() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            build [tool_command="exit 1"]
            gen [requires_tool_success=true, required_tool_node="build"]
            done [shape=Msquare]
            fail_exit [shape=Msquare]
            start -> build
            build -> gen [condition="outcome=fail"]
            build -> gen [condition="outcome=success"]
            gen -> done [condition="outcome=success"]
            gen -> fail_exit [condition="outcome=fail"]
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(
        RunConfig::new(&fx.source, &fx.runs)
            .with_test_backend()
            .with_run_id("reqtool"),
    );
    let result = runner.run(&graph, Path::new("p.dot")).await.unwrap();

    let status = status_of(&result.run_dir, "gen");
    assert_eq!(status.outcome, Outcome::Fail);
    assert!(status
        .failure_reason
        .unwrap()
        .contains("required tool node 'build'"));
    assert!(result.run_dir.join("fail_exit/status.json").exists());
}

// ============================================================================
// Validation blocks execution
// ============================================================================

#[tokio::test]
async fn invalid_graph_never_touches_the_filesystem() {
    let fx = fixture();
    let graph = parse_dot(
        r#"digraph G {
            start [shape=Mdiamond]
            orphan
            exit [shape=Msquare]
            start -> exit
            orphan -> exit
        }"#,
    )
    .unwrap();

    let runner = PipelineRunner::new(RunConfig::new(&fx.source, &fx.runs).with_run_id("invalid"));
    let err = runner.run(&graph, Path::new("p.dot")).await.unwrap_err();
    assert!(err.to_string().contains("unreachable"));
    assert!(!fx.runs.join("invalid").exists());
}
