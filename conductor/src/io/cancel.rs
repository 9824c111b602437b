//! Cooperative cancellation for running steps.
//!
//! A token is an in-process flag plus an optional marker file. The marker
//! lets a second process (`conductor cancel`) interrupt a workflow that is
//! executing elsewhere.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: Option<PathBuf>,
}

impl CancelToken {
    /// Token that is only cancelled in-process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also observes `marker` on disk.
    pub fn with_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            marker: Some(marker.into()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.marker.as_deref().is_some_and(Path::exists)
    }

    /// Clear a consumed cancellation so later steps can run.
    pub fn reset(&self) -> Result<()> {
        self.flag.store(false, Ordering::SeqCst);
        if let Some(marker) = &self.marker
            && marker.exists()
        {
            fs::remove_file(marker)
                .with_context(|| format!("remove cancel marker {}", marker.display()))?;
            debug!(marker = %marker.display(), "cleared cancel marker");
        }
        Ok(())
    }
}

/// Ask the workflow watching `marker` to cancel its running step.
pub fn request_cancel(marker: &Path) -> Result<()> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(marker, b"cancel\n")
        .with_context(|| format!("write cancel marker {}", marker.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let handle = token.clone();
        handle.cancel();
        assert!(token.is_cancelled());
        token.reset().expect("reset");
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn marker_file_cancels_and_reset_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("wf").join("cancel");
        let token = CancelToken::with_marker(&marker);
        assert!(!token.is_cancelled());

        request_cancel(&marker).expect("request");
        assert!(token.is_cancelled());

        token.reset().expect("reset");
        assert!(!marker.exists());
        assert!(!token.is_cancelled());
    }
}
