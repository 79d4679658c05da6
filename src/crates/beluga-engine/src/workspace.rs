//! Workspace preparation, snapshots, diffs, and the write allowlist
//!
//! The workspace is the per-run copy of the caller's source tree that
//! handlers are allowed to mutate. The engine never sandboxes handler
//! processes; instead it snapshots the workspace before and after each
//! stage and judges the diff. That diff is the sole evidence for the
//! write-allowlist guardrail.
//!
//! Snapshot cost is bounded by a per-run hash cache keyed on
//! (path, mtime, size); the cache never survives the run.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size and content hash of one workspace file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the content
    pub sha256: String,
}

/// A point-in-time capture of every regular file in the workspace
///
/// Keys are workspace-relative paths in forward-slash form; directories
/// are not recorded.
pub type Snapshot = BTreeMap<String, FileStat>;

/// Per-run hash cache: relative path -> (mtime, size, sha256)
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<String, (SystemTime, u64, String)>,
}

/// Sorted difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDiff {
    /// Paths present only in the after snapshot
    pub created: Vec<String>,
    /// Paths in both whose hash or size differ
    pub modified: Vec<String>,
    /// Paths present only in the before snapshot
    pub deleted: Vec<String>,
}

impl WorkspaceDiff {
    /// Compute the diff of two snapshots; all three lists come out sorted
    pub fn between(before: &Snapshot, after: &Snapshot) -> Self {
        let mut diff = Self::default();
        for (path, stat) in after {
            match before.get(path) {
                None => diff.created.push(path.clone()),
                Some(old) if old != stat => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in before.keys() {
            if !after.contains_key(path) {
                diff.deleted.push(path.clone());
            }
        }
        // BTreeMap iteration is already ordered; keep the invariant explicit.
        diff.created.sort();
        diff.modified.sort();
        diff.deleted.sort();
        diff
    }

    /// Every touched path: created ∪ modified ∪ deleted
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.created
            .iter()
            .chain(self.modified.iter())
            .chain(self.deleted.iter())
    }

    /// True when nothing changed
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Populate a run workspace from the caller's source directory
///
/// `.git` is excluded, and when `runs_root` is a descendant of `source`
/// the runs tree itself is excluded so the copy cannot recurse into
/// prior runs. `fs::copy` carries permission bits, so executable files
/// stay executable.
pub fn prepare_workspace(source: &Path, workspace: &Path, runs_root: &Path) -> Result<()> {
    let canonical_source = source.canonicalize()?;
    let excluded_runs = runs_root
        .canonicalize()
        .ok()
        .filter(|runs| runs.starts_with(&canonical_source));
    fs::create_dir_all(workspace)?;
    copy_tree(&canonical_source, workspace, &excluded_runs)
}

fn copy_tree(from: &Path, to: &Path, excluded: &Option<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        if let Some(excluded) = excluded {
            if path == *excluded {
                continue;
            }
        }
        let dest = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
            copy_tree(&path, &dest, excluded)?;
        } else if file_type.is_file() {
            fs::copy(&path, &dest)?;
        }
        // Symlinks and other special files are not carried into the
        // workspace; handlers operate on regular files only.
    }
    Ok(())
}

/// Capture a snapshot of the workspace
///
/// Unchanged files (same mtime and size as the cached entry) reuse the
/// cached hash instead of being re-read.
pub fn snapshot(workspace: &Path, cache: &mut HashCache) -> Result<Snapshot> {
    let mut snap = Snapshot::new();
    walk_files(workspace, workspace, &mut |rel, path| {
        let metadata = fs::metadata(path)?;
        let size = metadata.len();
        let mtime = metadata.modified()?;

        if let Some((cached_mtime, cached_size, hash)) = cache.entries.get(rel) {
            if *cached_mtime == mtime && *cached_size == size {
                snap.insert(rel.to_string(), FileStat {
                    size,
                    sha256: hash.clone(),
                });
                return Ok(());
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(fs::read(path)?);
        let sha256 = format!("{:x}", hasher.finalize());
        cache
            .entries
            .insert(rel.to_string(), (mtime, size, sha256.clone()));
        snap.insert(rel.to_string(), FileStat { size, sha256 });
        Ok(())
    })?;
    Ok(snap)
}

fn walk_files(
    root: &Path,
    dir: &Path,
    visit: &mut impl FnMut(&str, &Path) -> Result<()>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(root, &path, visit)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            visit(&rel, &path)?;
        }
    }
    Ok(())
}

/// Parse a comma-separated `allowed_write_paths` attribute
pub fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when `path` is covered by at least one allowlist entry
///
/// An entry is an exact path (`main.go`) or a directory prefix marked by
/// a trailing slash (`src/`). A directory prefix matches the bare
/// directory path itself and anything beneath it.
pub fn allowlist_matches(path: &str, entries: &[String]) -> bool {
    entries.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('/') {
            path == prefix || path.starts_with(&format!("{prefix}/"))
        } else {
            path == entry
        }
    })
}

/// Diff entries not covered by the allowlist, sorted
pub fn disallowed_paths(diff: &WorkspaceDiff, entries: &[String]) -> Vec<String> {
    let mut out: Vec<String> = diff
        .touched()
        .filter(|path| !allowlist_matches(path, entries))
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}
