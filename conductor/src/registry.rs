//! Per-worktree locking and concurrent workflow driving.
//!
//! Workflows on different worktrees run fully in parallel. Anything that
//! reads or rewrites a worktree (batch runs, snapshot restore, change
//! summaries) holds that worktree's lock, so two workflows pointed at the
//! same tree serialize instead of interleaving edits.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Result, anyhow};
use tracing::debug;

type LockMap = HashMap<PathBuf, Arc<Mutex<()>>>;

/// Registry of per-worktree mutexes. Clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct WorktreeLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl WorktreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for the worktree at `workdir`.
    ///
    /// Paths are canonicalized so `repo` and `repo/.` share a lock. A lock
    /// poisoned by a panicking holder is recovered; the worktree itself is
    /// still consistent with whatever the state file records.
    pub fn with_worktree<T>(&self, workdir: &Path, f: impl FnOnce() -> T) -> T {
        let key = fs::canonicalize(workdir).unwrap_or_else(|_| workdir.to_path_buf());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(worktree = %key.display(), "acquired worktree lock");
        let out = f();
        debug!(worktree = %key.display(), "released worktree lock");
        out
    }

    /// Number of worktrees that have been locked at least once.
    pub fn known_worktrees(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Run each job on its own thread and collect the results in input order.
///
/// A job that panics is reported as an error instead of tearing down the
/// other workflows.
pub fn run_concurrently<T, F>(jobs: Vec<F>) -> Vec<Result<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    thread::scope(|scope| {
        let handles: Vec<_> = jobs.into_iter().map(|job| scope.spawn(job)).collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("workflow job {index} panicked")))
            })
            .collect()
    })
}
