//! Engine-owned state transitions for a workflow.
//!
//! These functions apply narrowly scoped updates to a [`WorkflowState`] after
//! a batch run, an approval, or a blocker resolution. Side effects (git
//! restore, driver calls, persistence) are the caller's job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::core::cascade::{cascade_skips, release_skips};
use crate::core::checkpoint::should_checkpoint;
use crate::core::types::{
    BatchApproval, BatchResult, BatchStatus, BlockerKind, BlockerReport, Resolution, SkipRecord,
    WorkflowState, WorkflowStatus,
};

/// What the engine does after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Run the batch under the cursor.
    Continue,
    /// Persist and wait for a batch approval.
    AwaitApproval,
    /// Persist and wait for a blocker resolution.
    AwaitResolution,
    /// Nothing left to run.
    Finished,
}

/// Output of one batch executor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub result: BatchResult,
    /// Cascade skips introduced by a failure in this run.
    pub new_skips: BTreeMap<String, SkipRecord>,
    /// Index of the blocked step within the batch.
    pub blocked_at: Option<usize>,
}

/// Record a batch outcome and decide the next transition.
pub fn apply_batch_outcome(state: &mut WorkflowState, outcome: BatchOutcome) -> Transition {
    state.skipped.extend(outcome.new_skips);

    match outcome.result.status {
        BatchStatus::Blocked => {
            state.blocker = outcome.result.blocker.clone();
            state.resolution = None;
            state.cursor.step = outcome.blocked_at.unwrap_or(state.cursor.step);
            state.status = WorkflowStatus::Blocked;
            state.batch_results.push(outcome.result);
            Transition::AwaitResolution
        }
        BatchStatus::Complete => {
            state.batch_results.push(outcome.result);
            state.blocker = None;
            state.snapshot = None;
            state.cursor.batch += 1;
            state.cursor.step = 0;
            next_after_complete(state)
        }
        BatchStatus::Partial => {
            state.batch_results.push(outcome.result);
            state.status = WorkflowStatus::Aborted;
            Transition::Finished
        }
    }
}

/// Decide between finishing, pausing, and continuing once a batch completed.
fn next_after_complete(state: &mut WorkflowState) -> Transition {
    let Some(next) = state.plan.batches.get(state.cursor.batch) else {
        state.status = WorkflowStatus::AllDone;
        return Transition::Finished;
    };
    if should_checkpoint(next, state.trust_level) {
        state.status = WorkflowStatus::BatchComplete;
        Transition::AwaitApproval
    } else {
        state.status = WorkflowStatus::Executing;
        Transition::Continue
    }
}

/// Number of the batch an approval currently applies to.
pub fn pending_approval_batch(state: &WorkflowState) -> Option<u32> {
    if state.status != WorkflowStatus::BatchComplete {
        return None;
    }
    let idx = state.cursor.batch.checked_sub(1)?;
    state.plan.batches.get(idx).map(|batch| batch.number)
}

/// Record a human approval decision.
///
/// Approval resumes execution. Rejection stores the feedback so the engine
/// can hand it to the driver and raise the checkpoint again.
pub fn record_approval(
    state: &mut WorkflowState,
    approved: bool,
    feedback: Option<String>,
    at: DateTime<Utc>,
) -> Result<Transition, String> {
    let batch = pending_approval_batch(state).ok_or_else(|| {
        format!(
            "workflow '{}' is not awaiting approval (status {:?})",
            state.workflow_id, state.status
        )
    })?;
    state.approvals.push(BatchApproval {
        batch,
        approved,
        feedback: feedback.clone(),
        at,
    });
    if approved {
        state.feedback = None;
        state.status = WorkflowStatus::Executing;
        Ok(Transition::Continue)
    } else {
        state.feedback = Some(feedback.unwrap_or_default());
        Ok(Transition::AwaitApproval)
    }
}

/// Apply the bookkeeping part of a blocker resolution.
///
/// Retry and fix withdraw the cascade skips the blocked step caused. Skip
/// adds the step and its dependents to the skip set. Aborts close the
/// batch as partial and end the workflow.
pub fn apply_resolution(
    state: &mut WorkflowState,
    resolution: &Resolution,
) -> Result<Transition, String> {
    if state.status != WorkflowStatus::Blocked {
        return Err(format!(
            "workflow '{}' is not blocked (status {:?})",
            state.workflow_id, state.status
        ));
    }
    let blocker = state
        .blocker
        .clone()
        .ok_or_else(|| format!("workflow '{}' has no blocker report", state.workflow_id))?;
    let step_id = blocker.step_id.clone();
    state.resolution = Some(resolution.clone());

    match resolution {
        Resolution::Retry | Resolution::Fix { .. } => {
            release_skips(&step_id, &mut state.skipped);
            state.status = WorkflowStatus::Executing;
            Ok(Transition::Continue)
        }
        Resolution::Skip => {
            state.skipped.insert(
                step_id.clone(),
                SkipRecord {
                    cause: step_id.clone(),
                    reason: "skipped by user".to_string(),
                },
            );
            let cascaded = cascade_skips(&step_id, &state.plan, &state.skipped);
            state.skipped.extend(cascaded);
            state.status = WorkflowStatus::Executing;
            Ok(Transition::Continue)
        }
        Resolution::AbortKeep | Resolution::AbortRevert => {
            let number = state.current_batch_number().unwrap_or_default();
            let steps = state
                .batch_results
                .last()
                .filter(|last| last.batch == number && last.status == BatchStatus::Blocked)
                .map(|last| last.steps.clone())
                .unwrap_or_default();
            state.batch_results.push(BatchResult {
                batch: number,
                status: BatchStatus::Partial,
                steps,
                blocker: Some(blocker),
            });
            state.status = WorkflowStatus::Aborted;
            Ok(Transition::Finished)
        }
    }
}

/// Put a workflow back into `blocked` after a fix hand-off failed.
///
/// The new report keeps the step and its attempt history, records the fix
/// attempt, and the cascade skips withdrawn for the fix are restored.
pub fn reblock_after_fix(
    state: &mut WorkflowState,
    previous: &BlockerReport,
    instruction: &str,
    kind: BlockerKind,
    message: String,
) -> BlockerReport {
    let mut attempted = previous.attempted.clone();
    attempted.push(format!("fix: {instruction}"));
    let retry_fix = "retry the fix once the driver is reachable".to_string();
    let mut suggestions = vec![retry_fix.clone()];
    suggestions.extend(
        previous
            .suggestions
            .iter()
            .filter(|suggestion| **suggestion != retry_fix)
            .cloned(),
    );
    let report = BlockerReport {
        step_id: previous.step_id.clone(),
        step_description: previous.step_description.clone(),
        kind,
        message,
        attempted,
        suggestions,
        cascade_preview: previous.cascade_preview.clone(),
    };

    let restored = cascade_skips(&previous.step_id, &state.plan, &state.skipped);
    state.skipped.extend(restored);
    state.blocker = Some(report.clone());
    state.resolution = None;
    state.status = WorkflowStatus::Blocked;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Cursor, StepResult, StepStatus, TrustLevel};
    use crate::plan::RiskLevel;
    use crate::test_support::{batch, depends_on, plan, shell_step, step_with_risk};

    fn two_batch_state(trust: TrustLevel) -> WorkflowState {
        let plan = plan(vec![
            batch(1, vec![shell_step("a", "true"), shell_step("b", "true")]),
            batch(
                2,
                vec![depends_on(
                    step_with_risk(shell_step("c", "true"), RiskLevel::High),
                    &["b"],
                )],
            ),
        ]);
        WorkflowState::new("wf-1", plan, trust)
    }

    fn result(id: &str, status: StepStatus) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            status,
            output: String::new(),
            error: String::new(),
            command: None,
            duration_ms: 0,
            cancelled_by_user: false,
        }
    }

    fn complete(batch: u32, ids: &[&str]) -> BatchOutcome {
        BatchOutcome {
            result: BatchResult {
                batch,
                status: BatchStatus::Complete,
                steps: ids
                    .iter()
                    .map(|id| result(id, StepStatus::Completed))
                    .collect(),
                blocker: None,
            },
            new_skips: BTreeMap::new(),
            blocked_at: None,
        }
    }

    fn blocked_on_b(state: &WorkflowState) -> BatchOutcome {
        BatchOutcome {
            result: BatchResult {
                batch: 1,
                status: BatchStatus::Blocked,
                steps: vec![
                    result("a", StepStatus::Completed),
                    result("b", StepStatus::Failed),
                ],
                blocker: Some(BlockerReport {
                    step_id: "b".to_string(),
                    step_description: "b".to_string(),
                    kind: BlockerKind::ExecutionFailure,
                    message: "exit code 1".to_string(),
                    attempted: vec!["false".to_string()],
                    suggestions: Vec::new(),
                    cascade_preview: vec!["c".to_string()],
                }),
            },
            new_skips: cascade_skips("b", &state.plan, &state.skipped),
            blocked_at: Some(1),
        }
    }

    #[test]
    fn complete_batch_with_remaining_work_awaits_approval_under_standard() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let transition = apply_batch_outcome(&mut state, complete(1, &["a", "b"]));
        assert_eq!(transition, Transition::AwaitApproval);
        assert_eq!(state.status, WorkflowStatus::BatchComplete);
        assert_eq!(state.cursor, Cursor { batch: 1, step: 0 });
        assert_eq!(pending_approval_batch(&state), Some(1));
    }

    #[test]
    fn last_batch_complete_finishes() {
        let mut state = two_batch_state(TrustLevel::Autonomous);
        state.cursor.batch = 1;
        let transition = apply_batch_outcome(&mut state, complete(2, &["c"]));
        assert_eq!(transition, Transition::Finished);
        assert_eq!(state.status, WorkflowStatus::AllDone);
    }

    #[test]
    fn blocked_batch_records_blocker_and_cursor() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let outcome = blocked_on_b(&state);
        let transition = apply_batch_outcome(&mut state, outcome);
        assert_eq!(transition, Transition::AwaitResolution);
        assert_eq!(state.status, WorkflowStatus::Blocked);
        assert_eq!(state.cursor, Cursor { batch: 0, step: 1 });
        assert!(state.skipped.contains_key("c"));
    }

    #[test]
    fn retry_withdraws_cascade_skips() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let outcome = blocked_on_b(&state);
        apply_batch_outcome(&mut state, outcome);

        let transition = apply_resolution(&mut state, &Resolution::Retry).expect("resolve");
        assert_eq!(transition, Transition::Continue);
        assert!(state.skipped.is_empty());
        assert_eq!(state.status, WorkflowStatus::Executing);
    }

    #[test]
    fn skip_marks_step_and_dependents() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let outcome = blocked_on_b(&state);
        apply_batch_outcome(&mut state, outcome);

        apply_resolution(&mut state, &Resolution::Skip).expect("resolve");
        assert_eq!(state.skipped["b"].reason, "skipped by user");
        assert_eq!(state.skipped["c"].cause, "b");
    }

    #[test]
    fn abort_records_partial_batch() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let outcome = blocked_on_b(&state);
        apply_batch_outcome(&mut state, outcome);

        let transition = apply_resolution(&mut state, &Resolution::AbortKeep).expect("resolve");
        assert_eq!(transition, Transition::Finished);
        assert_eq!(state.status, WorkflowStatus::Aborted);
        let last = state.batch_results.last().expect("result");
        assert_eq!(last.status, BatchStatus::Partial);
        let steps: Vec<(&str, StepStatus)> = last
            .steps
            .iter()
            .map(|step| (step.step_id.as_str(), step.status))
            .collect();
        assert_eq!(
            steps,
            vec![("a", StepStatus::Completed), ("b", StepStatus::Failed)]
        );
    }

    #[test]
    fn failed_fix_blocks_again_with_fix_attempt_recorded() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let outcome = blocked_on_b(&state);
        apply_batch_outcome(&mut state, outcome);
        let previous = state.blocker.clone().expect("blocker");
        apply_resolution(
            &mut state,
            &Resolution::Fix {
                instruction: "use python3".to_string(),
            },
        )
        .expect("resolve");
        assert!(state.skipped.is_empty());

        let report = reblock_after_fix(
            &mut state,
            &previous,
            "use python3",
            BlockerKind::DriverFailure,
            "driver timed out".to_string(),
        );
        assert_eq!(state.status, WorkflowStatus::Blocked);
        assert_eq!(state.resolution, None);
        assert_eq!(state.blocker.as_ref(), Some(&report));
        assert_eq!(report.kind, BlockerKind::DriverFailure);
        assert_eq!(report.attempted, vec!["false", "fix: use python3"]);
        assert!(state.skipped.contains_key("c"));
    }

    #[test]
    fn rejection_keeps_checkpoint_and_stores_feedback() {
        let mut state = two_batch_state(TrustLevel::Standard);
        apply_batch_outcome(&mut state, complete(1, &["a", "b"]));

        let transition = record_approval(
            &mut state,
            false,
            Some("rename the module".to_string()),
            Utc::now(),
        )
        .expect("record");
        assert_eq!(transition, Transition::AwaitApproval);
        assert_eq!(state.status, WorkflowStatus::BatchComplete);
        assert_eq!(state.feedback.as_deref(), Some("rename the module"));

        let transition = record_approval(&mut state, true, None, Utc::now()).expect("record");
        assert_eq!(transition, Transition::Continue);
        assert_eq!(state.approvals.len(), 2);
        assert!(state.feedback.is_none());
    }

    #[test]
    fn approval_outside_checkpoint_is_rejected() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let err = record_approval(&mut state, true, None, Utc::now()).expect_err("not paused");
        assert!(err.contains("not awaiting approval"));
    }

    #[test]
    fn resolution_requires_blocked_status() {
        let mut state = two_batch_state(TrustLevel::Standard);
        let err = apply_resolution(&mut state, &Resolution::Retry).expect_err("not blocked");
        assert!(err.contains("not blocked"));
    }
}
