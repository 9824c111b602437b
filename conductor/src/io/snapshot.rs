//! Pre-batch git snapshots and scoped reverts.
//!
//! A snapshot records HEAD and the set of files that were already dirty
//! before a batch ran. Reverting touches only files the batch changed after
//! that point, so pre-existing user edits survive an abort.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::types::GitSnapshot;
use crate::io::git::Git;

/// Files touched by [`restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Files checked out from the snapshot's HEAD.
    pub reverted: Vec<String>,
    /// Files the batch created, now deleted.
    pub removed: Vec<String>,
}

/// Record the repository state before a batch runs.
#[instrument(skip_all, fields(workdir = %git.workdir().display()))]
pub fn capture(git: &Git) -> Result<GitSnapshot> {
    let head = git.head_sha().context("resolve HEAD for snapshot")?;
    let dirty_before = git.dirty_paths().context("list dirty files for snapshot")?;
    let stash = if dirty_before.is_empty() {
        None
    } else {
        git.stash_create().context("record dirty content")?
    };
    debug!(head = %head, dirty = dirty_before.len(), "captured snapshot");
    Ok(GitSnapshot {
        head,
        dirty_before,
        stash,
    })
}

/// Files changed since `snapshot`, excluding those dirty beforehand. Sorted.
pub fn changed_since(git: &Git, snapshot: &GitSnapshot) -> Result<Vec<String>> {
    let before: BTreeSet<&str> = snapshot.dirty_before.iter().map(String::as_str).collect();
    let mut changed = BTreeSet::new();
    for path in git.diff_names_against(&snapshot.head)? {
        changed.insert(path);
    }
    for path in git.untracked_files()? {
        changed.insert(path);
    }
    Ok(changed
        .into_iter()
        .filter(|path| !before.contains(path.as_str()))
        .collect())
}

/// Undo the changes a batch made since `snapshot`.
///
/// Files present in the snapshot's HEAD are checked out from it; files that
/// did not exist there are deleted. HEAD is never moved and files dirty
/// before the snapshot are never touched.
#[instrument(skip_all, fields(head = %snapshot.head))]
pub fn restore(git: &Git, snapshot: &GitSnapshot) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();
    for path in changed_since(git, snapshot)? {
        if git.path_in_commit(&snapshot.head, &path)? {
            report.reverted.push(path);
        } else {
            report.removed.push(path);
        }
    }

    git.checkout_paths_from(&snapshot.head, &report.reverted)
        .context("revert changed files")?;
    git.remove_from_index(&report.removed)
        .context("unstage created files")?;
    for path in &report.removed {
        remove_created(git.workdir(), path)?;
    }

    info!(
        reverted = report.reverted.len(),
        removed = report.removed.len(),
        "restored snapshot"
    );
    Ok(report)
}

fn remove_created(root: &Path, relative: &str) -> Result<()> {
    let path = root.join(relative);
    if path.is_file() || path.is_symlink() {
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    // Prune directories the batch left empty.
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}
