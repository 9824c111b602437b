//! Workflow state storage under the engine's state root.
//!
//! Layout:
//!
//! ```text
//! <state_root>/
//!   .gitignore                 # "*", keeps engine files out of change sets
//!   config.toml
//!   workflows/<id>/state.json
//!   workflows/<id>/events.jsonl
//!   workflows/<id>/cancel      # present while a cancel is requested
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::types::WorkflowState;

/// Paths owned by one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowPaths {
    pub dir: PathBuf,
    pub state: PathBuf,
    pub events: PathBuf,
    pub cancel_marker: PathBuf,
}

impl WorkflowPaths {
    pub fn new(state_root: &Path, workflow_id: &str) -> Self {
        let dir = state_root.join("workflows").join(workflow_id);
        Self {
            state: dir.join("state.json"),
            events: dir.join("events.jsonl"),
            cancel_marker: dir.join("cancel"),
            dir,
        }
    }
}

pub fn config_path(state_root: &Path) -> PathBuf {
    state_root.join("config.toml")
}

/// Create the state root and its catch-all `.gitignore`.
pub fn ensure_state_root(state_root: &Path) -> Result<()> {
    fs::create_dir_all(state_root)
        .with_context(|| format!("create directory {}", state_root.display()))?;
    let ignore = state_root.join(".gitignore");
    if !ignore.exists() {
        fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
    }
    Ok(())
}

/// Reject ids that could escape the workflows directory.
pub fn validate_workflow_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("workflow id must not be empty");
    }
    if id.starts_with('.') {
        bail!("workflow id '{id}' must not start with '.'");
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!("workflow id '{id}' contains invalid character '{bad}'");
    }
    Ok(())
}

/// Load a workflow's persisted state.
pub fn load_state(state_root: &Path, workflow_id: &str) -> Result<WorkflowState> {
    validate_workflow_id(workflow_id)?;
    let path = WorkflowPaths::new(state_root, workflow_id).state;
    if !path.exists() {
        return Err(anyhow!("unknown workflow '{workflow_id}'"));
    }
    debug!(path = %path.display(), "loading workflow state");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let state: WorkflowState =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if state.workflow_id != workflow_id {
        bail!(
            "state file {} belongs to workflow '{}'",
            path.display(),
            state.workflow_id
        );
    }
    Ok(state)
}

/// Atomically write a workflow's state (temp file + rename).
pub fn write_state(state_root: &Path, state: &WorkflowState) -> Result<()> {
    validate_workflow_id(&state.workflow_id)?;
    ensure_state_root(state_root)?;
    let path = WorkflowPaths::new(state_root, &state.workflow_id).state;
    debug!(
        path = %path.display(),
        status = ?state.status,
        batch = state.cursor.batch,
        step = state.cursor.step,
        "writing workflow state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// Ids of all persisted workflows, sorted.
pub fn list_workflows(state_root: &Path) -> Result<Vec<String>> {
    let dir = state_root.join("workflows");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if entry.path().join("state.json").is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
