//! Shared deterministic types for engine core logic.
//!
//! These types define stable contracts between components and are persisted
//! as part of the workflow record, so their serialized shape must stay stable.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

/// Outcome of one step, with output bounded by [`crate::core::truncate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: String,
    pub error: String,
    /// The action actually executed (after fallbacks).
    pub command: Option<String>,
    pub duration_ms: u64,
    pub cancelled_by_user: bool,
}

impl StepResult {
    pub fn skipped(step_id: &str, reason: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: reason.to_string(),
            error: String::new(),
            command: None,
            duration_ms: 0,
            cancelled_by_user: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    ValidationFailure,
    ExecutionFailure,
    UserCancelled,
    /// The driver boundary failed permanently or exhausted its retries.
    DriverFailure,
}

impl BlockerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockerKind::ValidationFailure => "validation_failure",
            BlockerKind::ExecutionFailure => "execution_failure",
            BlockerKind::UserCancelled => "user_cancelled",
            BlockerKind::DriverFailure => "driver_failure",
        }
    }
}

/// Actionable description of why a batch halted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerReport {
    pub step_id: String,
    pub step_description: String,
    pub kind: BlockerKind,
    pub message: String,
    /// Actions already tried, in order (primary command, then each fallback).
    pub attempted: Vec<String>,
    pub suggestions: Vec<String>,
    /// Steps that stay skipped if the human chooses to skip this one.
    #[serde(default)]
    pub cascade_preview: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Complete,
    Blocked,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch: u32,
    pub status: BatchStatus,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<BlockerReport>,
}

/// Minimal pre-batch repository reference used to scope a later revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSnapshot {
    pub head: String,
    /// Files already dirty (modified, staged or untracked) before the batch.
    pub dirty_before: Vec<String>,
    /// `git stash create` commit recording pre-batch dirty content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchApproval {
    pub batch: u32,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub at: DateTime<Utc>,
}

/// How often the workflow pauses for human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Paranoid,
    Standard,
    Autonomous,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustLevel::Paranoid => "paranoid",
            TrustLevel::Standard => "standard",
            TrustLevel::Autonomous => "autonomous",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Executing,
    BatchComplete,
    Blocked,
    AllDone,
    Aborted,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::BatchComplete => "batch_complete",
            WorkflowStatus::Blocked => "blocked",
            WorkflowStatus::AllDone => "all_done",
            WorkflowStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::AllDone | WorkflowStatus::Aborted)
    }
}

/// Human choice for an outstanding blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    Retry,
    Skip,
    Fix { instruction: String },
    AbortKeep,
    AbortRevert,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Retry => "retry",
            Resolution::Skip => "skip",
            Resolution::Fix { .. } => "fix",
            Resolution::AbortKeep => "abort_keep",
            Resolution::AbortRevert => "abort_revert",
        }
    }
}

/// Why a step is in the skip set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    /// Step whose failure or skip caused this one.
    pub cause: String,
    pub reason: String,
}

/// Position of the next step to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Index into `plan.batches`.
    pub batch: usize,
    /// Index into the batch's steps.
    pub step: usize,
}

/// Persisted aggregate root for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub plan: Plan,
    pub trust_level: TrustLevel,
    pub cursor: Cursor,
    pub batch_results: Vec<BatchResult>,
    pub approvals: Vec<BatchApproval>,
    pub skipped: BTreeMap<String, SkipRecord>,
    pub blocker: Option<BlockerReport>,
    pub resolution: Option<Resolution>,
    /// Snapshot for the batch in flight.
    pub snapshot: Option<GitSnapshot>,
    pub status: WorkflowStatus,
    /// Rejection feedback awaiting revision of the last completed batch.
    #[serde(default)]
    pub feedback: Option<String>,
}

impl WorkflowState {
    pub fn new(workflow_id: &str, plan: Plan, trust_level: TrustLevel) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            plan,
            trust_level,
            cursor: Cursor::default(),
            batch_results: Vec::new(),
            approvals: Vec::new(),
            skipped: BTreeMap::new(),
            blocker: None,
            resolution: None,
            snapshot: None,
            status: WorkflowStatus::Executing,
            feedback: None,
        }
    }

    /// Number of the batch the cursor points at, if any remain.
    pub fn current_batch_number(&self) -> Option<u32> {
        self.plan
            .batches
            .get(self.cursor.batch)
            .map(|batch| batch.number)
    }

    /// Results recorded before the cursor in the batch currently in flight.
    ///
    /// When a blocked batch resumes, the steps that already finished are
    /// carried into the next result so it lists the whole batch in order.
    pub fn carried_results(&self) -> Vec<StepResult> {
        let Some(number) = self.current_batch_number() else {
            return Vec::new();
        };
        let Some(last) = self.batch_results.last() else {
            return Vec::new();
        };
        if last.batch != number || last.status != BatchStatus::Blocked {
            return Vec::new();
        }
        last.steps
            .iter()
            .take(self.cursor.step)
            .cloned()
            .collect()
    }

    /// Ids of every step that completed in any recorded batch result.
    pub fn completed_step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .batch_results
            .iter()
            .flat_map(|result| result.steps.iter())
            .filter(|step| step.status == StepStatus::Completed)
            .map(|step| step.step_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
