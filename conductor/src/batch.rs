//! Batch execution.
//!
//! Runs the batch under the workflow cursor: snapshot, optional batch
//! review, then each step in order (skip, validate, execute) until the
//! batch completes or a step blocks. Nothing is rolled back automatically.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::context::ExecContext;
use crate::core::cascade::{cascade_skips, preview_cascade};
use crate::core::machine::BatchOutcome;
use crate::core::types::{
    BatchResult, BatchStatus, BlockerKind, BlockerReport, SkipRecord, StepResult, StepStatus,
    WorkflowState,
};
use crate::fallback::execute;
use crate::io::events::{EngineEvent, EventSink};
use crate::io::git::Git;
use crate::io::snapshot;
use crate::plan::{Batch, Step};
use crate::validator::{needs_batch_review, review_batch, validate};

/// Run the batch at `state.cursor`.
///
/// A snapshot is taken before the first step of a fresh batch and handed to
/// `persist` before anything runs. A batch resumed after a blocker reuses
/// its snapshot and starts at the blocked step; results recorded for earlier
/// steps are carried into the returned result.
#[instrument(skip_all, fields(workflow_id = %state.workflow_id, batch = state.cursor.batch, step = state.cursor.step))]
pub fn run_batch(
    ctx: &ExecContext<'_>,
    git: &Git,
    state: &mut WorkflowState,
    sink: &dyn EventSink,
    persist: &mut dyn FnMut(&WorkflowState) -> Result<()>,
) -> Result<BatchOutcome> {
    let batch = state
        .plan
        .batches
        .get(state.cursor.batch)
        .cloned()
        .ok_or_else(|| anyhow!("no batch at index {}", state.cursor.batch))?;
    let start = state.cursor.step;

    if state.snapshot.is_none() {
        let snap = snapshot::capture(git).context("snapshot before batch")?;
        state.snapshot = Some(snap);
        persist(state)?;
    }

    let workflow_id = state.workflow_id.clone();
    sink.emit(
        &workflow_id,
        &EngineEvent::BatchStarted {
            batch: batch.number,
            risk: batch.risk_summary(),
            steps: batch.step_ids(),
        },
    )?;

    let mut results = state.carried_results();

    if start == 0 && needs_batch_review(&batch) {
        let review = review_batch(ctx, &batch)?;
        if !review.ok {
            let first = &batch.steps[0];
            let kind = review.kind.unwrap_or(BlockerKind::ValidationFailure);
            let message = review
                .issue
                .unwrap_or_else(|| "batch review rejected the batch".to_string());
            warn!(message = %message, "batch review failed");
            let blocker = blocker_report(
                state,
                first,
                kind,
                message,
                review.attempted,
                review.suggestions,
            );
            return finish_blocked(sink, &workflow_id, &batch, results, blocker, 0, BTreeMap::new());
        }
    }

    for (idx, step) in batch.steps.iter().enumerate().skip(start) {
        if let Some(record) = state.skipped.get(&step.id) {
            debug!(step_id = %step.id, "skipping step");
            sink.emit(
                &workflow_id,
                &EngineEvent::StepSkipped {
                    step_id: step.id.clone(),
                    reason: record.reason.clone(),
                },
            )?;
            results.push(StepResult::skipped(&step.id, &record.reason));
            continue;
        }

        sink.emit(
            &workflow_id,
            &EngineEvent::StepStarted {
                batch: batch.number,
                step_id: step.id.clone(),
            },
        )?;

        let validation = validate(ctx, step, state)?;
        if !validation.ok {
            let kind = validation.kind.unwrap_or(BlockerKind::ValidationFailure);
            let message = validation
                .issue
                .unwrap_or_else(|| "validation failed".to_string());
            let cancelled = kind == BlockerKind::UserCancelled;
            results.push(StepResult {
                step_id: step.id.clone(),
                status: if cancelled {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Failed
                },
                output: String::new(),
                error: message.clone(),
                command: None,
                duration_ms: 0,
                cancelled_by_user: cancelled,
            });
            emit_step_stopped(sink, &workflow_id, step, kind, &message, &validation.attempted, "")?;
            // Cancellation counts as a failure for dependents; a rejected
            // check leaves them eligible until the human decides.
            let new_skips = if cancelled {
                ctx.cancel.reset()?;
                cascade_skips(&step.id, &state.plan, &state.skipped)
            } else {
                BTreeMap::new()
            };
            let blocker = blocker_report(
                state,
                step,
                kind,
                message,
                validation.attempted,
                validation.suggestions,
            );
            return finish_blocked(sink, &workflow_id, &batch, results, blocker, idx, new_skips);
        }

        let execution = execute(ctx, step)?;
        match execution.result.status {
            StepStatus::Completed | StepStatus::Skipped => {
                sink.emit(
                    &workflow_id,
                    &EngineEvent::StepCompleted {
                        step_id: step.id.clone(),
                        duration_ms: execution.result.duration_ms,
                        command: execution.result.command.clone(),
                        output: execution.result.output.clone(),
                    },
                )?;
                results.push(execution.result);
            }
            StepStatus::Failed | StepStatus::Cancelled => {
                let kind = if execution.result.status == StepStatus::Cancelled {
                    ctx.cancel.reset()?;
                    BlockerKind::UserCancelled
                } else {
                    BlockerKind::ExecutionFailure
                };
                emit_step_stopped(
                    sink,
                    &workflow_id,
                    step,
                    kind,
                    &execution.message,
                    &execution.attempted,
                    &execution.result.output,
                )?;
                let new_skips = cascade_skips(&step.id, &state.plan, &state.skipped);
                results.push(execution.result);
                let suggestions = execution_suggestions(step, &execution.attempted);
                let blocker = blocker_report(
                    state,
                    step,
                    kind,
                    execution.message,
                    execution.attempted,
                    suggestions,
                );
                return finish_blocked(sink, &workflow_id, &batch, results, blocker, idx, new_skips);
            }
        }
    }

    info!(batch = batch.number, steps = results.len(), "batch complete");
    sink.emit(
        &workflow_id,
        &EngineEvent::BatchCompleted {
            batch: batch.number,
            status: BatchStatus::Complete,
        },
    )?;
    Ok(BatchOutcome {
        result: BatchResult {
            batch: batch.number,
            status: BatchStatus::Complete,
            steps: results,
            blocker: None,
        },
        new_skips: BTreeMap::new(),
        blocked_at: None,
    })
}

fn finish_blocked(
    sink: &dyn EventSink,
    workflow_id: &str,
    batch: &Batch,
    steps: Vec<StepResult>,
    blocker: BlockerReport,
    blocked_at: usize,
    new_skips: BTreeMap<String, SkipRecord>,
) -> Result<BatchOutcome> {
    info!(batch = batch.number, step_id = %blocker.step_id, kind = blocker.kind.as_str(), "batch blocked");
    sink.emit(
        workflow_id,
        &EngineEvent::BatchCompleted {
            batch: batch.number,
            status: BatchStatus::Blocked,
        },
    )?;
    Ok(BatchOutcome {
        result: BatchResult {
            batch: batch.number,
            status: BatchStatus::Blocked,
            steps,
            blocker: Some(blocker),
        },
        new_skips,
        blocked_at: Some(blocked_at),
    })
}

fn emit_step_stopped(
    sink: &dyn EventSink,
    workflow_id: &str,
    step: &Step,
    kind: BlockerKind,
    message: &str,
    attempted: &[String],
    output: &str,
) -> Result<()> {
    let event = if kind == BlockerKind::UserCancelled {
        EngineEvent::StepCancelled {
            step_id: step.id.clone(),
        }
    } else {
        EngineEvent::StepFailed {
            step_id: step.id.clone(),
            message: message.to_string(),
            attempted: attempted.to_vec(),
            output: output.to_string(),
        }
    };
    sink.emit(workflow_id, &event)
}

fn blocker_report(
    state: &WorkflowState,
    step: &Step,
    kind: BlockerKind,
    message: String,
    attempted: Vec<String>,
    mut suggestions: Vec<String>,
) -> BlockerReport {
    let cascade_preview = preview_cascade(&step.id, &state.plan);
    suggestions.push("retry once the cause is fixed".to_string());
    if cascade_preview.is_empty() {
        suggestions.push(format!("skip '{}'", step.id));
    } else {
        suggestions.push(format!(
            "skip '{}' (also skips {})",
            step.id,
            cascade_preview.join(", ")
        ));
    }
    suggestions.push("abort and keep or revert this batch's changes".to_string());
    BlockerReport {
        step_id: step.id.clone(),
        step_description: step.description.clone(),
        kind,
        message,
        attempted,
        suggestions,
        cascade_preview,
    }
}

fn execution_suggestions(step: &Step, attempted: &[String]) -> Vec<String> {
    let mut suggestions = vec![format!(
        "fix '{}' with an instruction for the driver",
        step.id
    )];
    if attempted.len() == 1 {
        suggestions.push("add fallback commands to the plan".to_string());
    }
    suggestions
}
