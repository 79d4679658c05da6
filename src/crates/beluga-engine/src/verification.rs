//! Deterministic verification subsystem
//!
//! A verification stage executes a structured plan from run context:
//! required workspace files plus allowlisted commands. Every command is
//! screened twice — allowlist matching over a normalized form, then a
//! shell-safety check on the raw text — and finally executed *without a
//! shell*: whitespace-split argv with leading environment assignments
//! turned into process env bindings.
//!
//! All verification failures are stage outcomes, never engine errors;
//! the plan and per-command results are persisted next to the stage's
//! other artifacts.

use crate::context::{RunContext, KEY_VERIFICATION_PLAN};
use crate::error::Result;
use crate::outcome::StageRecord;
use beluga_graph::Node;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// A parsed verification plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationPlan {
    /// Workspace-relative files that must exist
    #[serde(default)]
    pub files: Vec<String>,
    /// Commands to execute, in order
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Result of one executed verification command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Original command text from the plan
    pub command: String,
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Characters and operators that disqualify a command from execution
const SHELL_UNSAFE: [&str; 9] = ["&&", "||", ";", "|", "`", "$(", ">", "<", "\r"];

fn env_assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=.*$").expect("static regex"))
}

/// Execute a verification stage
///
/// Reads the plan from the context key configured on the node (default
/// `verification.plan`), validates paths and commands, persists
/// `verification.plan.json`, runs the plan, and persists
/// `verification.results.json`.
pub async fn run_verification(
    node: &Node,
    context: &RunContext,
    workspace: &Path,
    artifact_dir: &Path,
) -> Result<StageRecord> {
    let plan_key = node
        .attrs
        .get_str("verification.plan_context_key")
        .unwrap_or(KEY_VERIFICATION_PLAN);

    let Some(raw_plan) = context.get(plan_key) else {
        return Ok(StageRecord::fail(format!(
            "verification plan missing from context key '{plan_key}'"
        )));
    };

    let plan: VerificationPlan = match serde_json::from_value(raw_plan.clone()) {
        Ok(plan) => plan,
        Err(err) => {
            return Ok(StageRecord::fail(format!(
                "verification plan is malformed: {err}"
            )));
        }
    };

    let mut files = Vec::with_capacity(plan.files.len());
    for path in &plan.files {
        match normalize_plan_path(path, workspace) {
            Ok(normalized) => files.push(normalized),
            Err(reason) => return Ok(StageRecord::fail(reason)),
        }
    }
    for command in &plan.commands {
        if command.trim().is_empty() {
            return Ok(StageRecord::fail(
                "verification plan contains an empty command",
            ));
        }
    }
    let plan = VerificationPlan {
        files,
        commands: plan.commands,
    };

    let Some(allowlist_raw) = node.attrs.get_str("verification.allowed_commands") else {
        return Ok(StageRecord::fail(
            "verification node is missing the verification.allowed_commands attribute",
        ));
    };
    let allowlist: Vec<String> = allowlist_raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    std::fs::write(
        artifact_dir.join("verification.plan.json"),
        serde_json::to_vec_pretty(&plan)?,
    )?;

    for command in &plan.commands {
        let normalized = normalize_for_matching(command);
        if !allowlist_permits(&normalized, &allowlist) {
            return Ok(StageRecord::fail(format!(
                "verification command not in allowlist: {command}"
            )));
        }
        if let Some(token) = shell_unsafe_token(command) {
            return Ok(StageRecord::fail(format!(
                "verification command contains shell metacharacter '{token}': {command}"
            )));
        }
    }

    let workdir = match node.attrs.get_str("verification.workdir") {
        Some(rel) => workspace.join(rel.trim_start_matches('/')),
        None => workspace.to_path_buf(),
    };
    if !workdir.is_dir() {
        return Ok(StageRecord::fail(format!(
            "verification workdir does not exist: {}",
            workdir.display()
        )));
    }

    for file in &plan.files {
        if !workspace.join(file).exists() {
            return Ok(StageRecord::fail(format!(
                "verification file missing: {file}"
            )));
        }
    }

    let mut results: Vec<CommandResult> = Vec::new();
    let mut failure: Option<String> = None;
    for command in &plan.commands {
        let result = execute_command(command, &workdir).await?;
        let exit_code = result.exit_code;
        tracing::debug!(command = command.as_str(), exit_code, "verification command finished");
        results.push(result);
        if exit_code != 0 {
            failure = Some(format!(
                "verification command failed: {command} (exit={exit_code})"
            ));
            break;
        }
    }

    std::fs::write(
        artifact_dir.join("verification.results.json"),
        serde_json::to_vec_pretty(&results)?,
    )?;

    Ok(match failure {
        Some(reason) => StageRecord::fail(reason),
        None => StageRecord::success(),
    })
}

/// Normalize a plan file path to workspace-relative forward-slash form
///
/// Relative paths may not contain `..` segments or `~`; absolute paths
/// are accepted only when they resolve under the workspace, in which
/// case they are rewritten relative.
pub fn normalize_plan_path(path: &str, workspace: &Path) -> std::result::Result<String, String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("verification plan contains an empty file path".to_string());
    }
    if trimmed.contains('~') {
        return Err(format!("verification file path contains '~': {trimmed}"));
    }
    if trimmed.split('/').any(|seg| seg == "..") {
        return Err(format!("verification file path contains '..': {trimmed}"));
    }
    if trimmed.starts_with('/') {
        let workspace_str = workspace.to_string_lossy();
        let prefix = format!("{}/", workspace_str.trim_end_matches('/'));
        if let Some(rel) = trimmed.strip_prefix(&prefix) {
            return Ok(rel.to_string());
        }
        return Err(format!(
            "verification file path is outside the workspace: {trimmed}"
        ));
    }
    Ok(trimmed.trim_start_matches("./").to_string())
}

/// Normalize a command for allowlist matching
///
/// Iterates to a fixed point: strip wrapping parentheses, strip a
/// leading run of environment-assignment tokens, strip a leading
/// `cd … && ` or `export … && ` wrapper.
pub fn normalize_for_matching(command: &str) -> String {
    let mut current = command.trim().to_string();
    loop {
        let before = current.clone();

        if current.starts_with('(') && current.ends_with(')') && current.len() >= 2 {
            current = current[1..current.len() - 1].trim().to_string();
        }

        if let Some(first) = current.split_whitespace().next() {
            if env_assignment_re().is_match(first) {
                current = current[first.len()..].trim_start().to_string();
            }
        }

        for wrapper in ["cd ", "export "] {
            if current.starts_with(wrapper) {
                if let Some(pos) = current.find("&&") {
                    current = current[pos + 2..].trim_start().to_string();
                }
            }
        }

        if current == before {
            return current;
        }
    }
}

/// A normalized command passes when it equals an allowlist entry or
/// begins with an entry followed by a space
pub fn allowlist_permits(normalized: &str, allowlist: &[String]) -> bool {
    allowlist
        .iter()
        .any(|entry| normalized == entry || normalized.starts_with(&format!("{entry} ")))
}

/// First shell metacharacter found in a command, if any
pub fn shell_unsafe_token(command: &str) -> Option<&'static str> {
    if command.contains('\n') {
        return Some("\\n");
    }
    SHELL_UNSAFE
        .iter()
        .find(|needle| command.contains(**needle))
        .map(|s| match *s {
            "\r" => "\\r",
            other => other,
        })
}

/// Execute one plan command without a shell
///
/// Wrapping parentheses are dropped, leading environment assignments
/// become process env bindings (with `$PWD` / `${PWD}` expanded to the
/// working directory), and the remaining whitespace-split tokens form
/// the executable and argv.
async fn execute_command(command: &str, workdir: &Path) -> Result<CommandResult> {
    let mut text = command.trim();
    while text.starts_with('(') && text.ends_with(')') && text.len() >= 2 {
        text = text[1..text.len() - 1].trim();
    }

    let pwd = workdir.to_string_lossy().to_string();
    let mut envs: Vec<(String, String)> = Vec::new();
    let mut tokens = text.split_whitespace().peekable();
    while let Some(token) = tokens.peek() {
        if !env_assignment_re().is_match(token) {
            break;
        }
        let token = tokens.next().expect("peeked token");
        let eq = token.find('=').expect("assignment token");
        let name = token[..eq].to_string();
        let value = strip_quotes(&token[eq + 1..])
            .replace("${PWD}", &pwd)
            .replace("$PWD", &pwd);
        envs.push((name, value));
    }

    let argv: Vec<&str> = tokens.map(strip_quotes).collect();
    let Some((program, args)) = argv.split_first() else {
        return Ok(CommandResult {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: "command has no executable token".to_string(),
        });
    };

    let output = tokio::process::Command::new(program)
        .args(args)
        .envs(envs)
        .current_dir(workdir)
        .output()
        .await;

    Ok(match output {
        Ok(output) => CommandResult {
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(err) => CommandResult {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to spawn: {err}"),
        },
    })
}

fn strip_quotes(token: &str) -> &str {
    token.trim_matches('"').trim_matches('\'')
}
