//! Git adapter for snapshots and scoped reverts.
//!
//! The engine never commits, branches, or moves HEAD on behalf of a
//! workflow. It only reads repository state and restores individual paths,
//! so this wrapper stays a small, explicit layer over `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&[
            "-c",
            "core.quotePath=false",
            "status",
            "--porcelain=v1",
            "-uall",
        ])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Sorted paths with any pending change, tracked or untracked.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Tracked paths whose worktree or index content differs from `rev`.
    pub fn diff_names_against(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "-c",
            "core.quotePath=false",
            "diff",
            "--name-only",
            rev,
            "--",
        ])?;
        Ok(non_empty_lines(&out))
    }

    /// Untracked paths that are not ignored.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "-c",
            "core.quotePath=false",
            "ls-files",
            "--others",
            "--exclude-standard",
        ])?;
        Ok(non_empty_lines(&out))
    }

    /// Record dirty tracked content as a dangling stash commit.
    ///
    /// Returns `None` when there is nothing to record. The stash list and
    /// the worktree are left untouched.
    #[instrument(skip_all)]
    pub fn stash_create(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["stash", "create"])?;
        let sha = out.trim();
        if sha.is_empty() {
            debug!("nothing to stash");
            return Ok(None);
        }
        debug!(stash = sha, "created stash commit");
        Ok(Some(sha.to_string()))
    }

    /// True if `path` exists in the tree of `rev`.
    pub fn path_in_commit(&self, rev: &str, path: &str) -> Result<bool> {
        let spec = format!("{rev}:{path}");
        let output = self.run(&["cat-file", "-e", &spec])?;
        Ok(output.status.success())
    }

    /// Restore `paths` in both index and worktree to their content at `rev`.
    #[instrument(skip_all, fields(rev = %rev, count = paths.len()))]
    pub fn checkout_paths_from(&self, rev: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["checkout", rev, "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Drop `paths` from the index without touching the worktree.
    pub fn remove_from_index(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["rm", "--cached", "--quiet", "--ignore-unmatch", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore). Test fixtures only.
    #[cfg(any(test, feature = "test-support"))]
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes with a message. Test fixtures only.
    #[cfg(any(test, feature = "test-support"))]
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<()> {
        debug!("committing staged changes");
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn non_empty_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
