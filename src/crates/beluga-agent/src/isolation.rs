//! Read-scope isolation: hide-and-restore
//!
//! Before an external agent runs, workspace subtrees it must not read
//! are renamed into a run-scoped hidden directory under the node's
//! artifact dir. After the subprocess exits — on success, failure, or
//! panic — the entries are renamed back in reverse order.
//!
//! Renames, not copies: a rename within one filesystem is atomic, cheap
//! regardless of subtree size, and exactly reversible. The one case that
//! must not be papered over is an agent recreating a blocked path while
//! it was hidden; restoring would overwrite agent output, so the restore
//! fails with [`IsolationError::DestinationRecreated`] instead.

use crate::error::IsolationError;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-scope configuration for an external agent invocation
#[derive(Debug, Clone, Default)]
pub struct ReadScope {
    /// Explicit workspace-relative paths to hide
    pub block_read_paths: Vec<String>,
    /// Keep the default scenario-script block list readable
    pub allow_read_scenarios: bool,
    /// Hide every top-level entry the agent has not declared a need for
    pub strict_read_scope: bool,
    /// The agent's declared working directory (top-level entry), if any
    pub agent_workdir: Option<String>,
    /// Additional directories the agent declared it reads
    pub read_paths: Vec<String>,
    /// The agent's own executable path, kept readable under strict scope
    pub agent_executable: Option<PathBuf>,
}

/// Subtree hidden from agents by default
const DEFAULT_BLOCK: &str = "scripts/scenarios";

impl ReadScope {
    /// Compute the effective block set for a workspace
    ///
    /// Entries are workspace-relative with no trailing slash. Under
    /// strict scope the top-level entries of the workspace that match
    /// neither the declared workdir, the declared read paths, nor the
    /// agent executable are appended.
    pub fn effective_block_set(&self, workspace: &Path) -> Result<Vec<String>, IsolationError> {
        let mut blocks: Vec<String> = Vec::new();
        if !self.allow_read_scenarios {
            blocks.push(DEFAULT_BLOCK.to_string());
        }
        for entry in &self.block_read_paths {
            blocks.push(entry.trim_end_matches('/').to_string());
        }

        if self.strict_read_scope {
            let mut keep: Vec<String> = Vec::new();
            if let Some(workdir) = &self.agent_workdir {
                keep.push(first_segment(workdir).to_string());
            }
            for p in &self.read_paths {
                keep.push(first_segment(p).to_string());
            }
            if let Some(exe) = &self.agent_executable {
                if let Ok(rel) = exe.strip_prefix(workspace) {
                    if let Some(first) = rel.components().next() {
                        keep.push(first.as_os_str().to_string_lossy().to_string());
                    }
                }
            }

            let mut entries: Vec<String> = Vec::new();
            for dir_entry in fs::read_dir(workspace)? {
                let name = dir_entry?.file_name().to_string_lossy().to_string();
                if !keep.contains(&name) {
                    entries.push(name);
                }
            }
            entries.sort();
            blocks.extend(entries);
        }

        for entry in &blocks {
            validate_block_entry(entry)?;
        }
        blocks.sort();
        blocks.dedup();
        Ok(blocks)
    }
}

fn first_segment(path: &str) -> &str {
    path.trim_start_matches("./").split('/').next().unwrap_or(path)
}

fn validate_block_entry(entry: &str) -> Result<(), IsolationError> {
    if entry.is_empty()
        || entry.starts_with('/')
        || entry.split('/').any(|seg| seg == "..")
    {
        return Err(IsolationError::InvalidBlockPath(entry.to_string()));
    }
    Ok(())
}

/// One hidden entry: where it was, where it went
#[derive(Debug)]
struct HiddenEntry {
    original: PathBuf,
    hidden: PathBuf,
}

/// An engaged hide-and-restore transaction
///
/// Obtain with [`HideAndRestore::engage`], finish with
/// [`HideAndRestore::restore`]. Dropping an unrestored guard (panic
/// path) restores best-effort and logs anything it could not put back.
#[derive(Debug)]
pub struct HideAndRestore {
    entries: Vec<HiddenEntry>,
    restored: bool,
}

impl HideAndRestore {
    /// Hide every existing block-set entry under `hidden_root`
    ///
    /// Entries that do not exist in the workspace are skipped. On a
    /// rename failure, everything already hidden is rolled back before
    /// the error is returned.
    pub fn engage(
        workspace: &Path,
        block_set: &[String],
        hidden_root: &Path,
    ) -> Result<Self, IsolationError> {
        let mut guard = Self {
            entries: Vec::new(),
            restored: false,
        };

        for entry in block_set {
            validate_block_entry(entry)?;
            let original = workspace.join(entry);
            if !original.exists() {
                continue;
            }
            fs::create_dir_all(hidden_root)?;
            let hidden = hidden_root.join(entry.replace('/', "__"));
            if let Err(source) = fs::rename(&original, &hidden) {
                let err = IsolationError::Rename {
                    path: original.clone(),
                    source,
                };
                // Put back whatever was already moved before bailing.
                let _ = guard.restore();
                return Err(err);
            }
            tracing::debug!(path = %original.display(), "hid workspace entry from agent");
            guard.entries.push(HiddenEntry { original, hidden });
        }

        Ok(guard)
    }

    /// Rename every hidden entry back, in reverse order of hiding
    pub fn restore(&mut self) -> Result<(), IsolationError> {
        if self.restored {
            return Ok(());
        }
        while let Some(entry) = self.entries.pop() {
            if entry.original.exists() {
                // Re-queue so a retried restore still sees the entry.
                let recreated = entry.original.clone();
                self.entries.push(entry);
                return Err(IsolationError::DestinationRecreated(recreated));
            }
            if let Some(parent) = entry.original.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&entry.hidden, &entry.original).map_err(|source| {
                IsolationError::Rename {
                    path: entry.original.clone(),
                    source,
                }
            })?;
        }
        self.restored = true;
        Ok(())
    }

    /// Number of entries currently hidden
    pub fn hidden_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for HideAndRestore {
    fn drop(&mut self) {
        if self.restored || self.entries.is_empty() {
            return;
        }
        if let Err(err) = self.restore() {
            tracing::error!(error = %err, "failed to restore hidden workspace entries");
        }
    }
}
