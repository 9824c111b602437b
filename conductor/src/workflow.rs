//! Workflow engine: drives accepted plans batch by batch.
//!
//! The engine persists state before every pause, so a process that exits
//! while a workflow awaits approval or a blocker resolution can pick it up
//! later with [`Engine::submit_approval`], [`Engine::resolve_blocker`] or
//! [`Engine::resume`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{info, instrument, warn};

use crate::batch::run_batch;
use crate::context::ExecContext;
use crate::core::acceptance::accept_plan;
use crate::core::machine::{
    Transition, apply_batch_outcome, apply_resolution, reblock_after_fix, record_approval,
};
use crate::core::types::{BlockerKind, Resolution, TrustLevel, WorkflowState, WorkflowStatus};
use crate::io::cancel::{CancelToken, request_cancel};
use crate::io::config::EngineConfig;
use crate::io::driver::{Driver, DriverError, DriverPurpose};
use crate::io::events::{EngineEvent, EventSink};
use crate::io::git::Git;
use crate::io::prompt::PromptEngine;
use crate::io::snapshot;
use crate::io::state_store::{
    WorkflowPaths, ensure_state_root, load_state, validate_workflow_id, write_state,
};
use crate::plan::{Batch, Plan, RiskLevel};
use crate::registry::WorktreeLocks;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Generated when absent.
    pub workflow_id: Option<String>,
    /// Falls back to the configured trust level.
    pub trust_level: Option<TrustLevel>,
}

pub struct Engine {
    workdir: PathBuf,
    state_root: PathBuf,
    config: EngineConfig,
    driver: Arc<dyn Driver>,
    sink: Arc<dyn EventSink>,
    locks: WorktreeLocks,
    prompts: PromptEngine,
    cancels: Mutex<HashMap<String, CancelToken>>,
}

impl Engine {
    pub fn new(
        workdir: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
        config: EngineConfig,
        driver: Arc<dyn Driver>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            state_root: state_root.into(),
            config,
            driver,
            sink,
            locks: WorktreeLocks::new(),
            prompts: PromptEngine::new(),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Share a lock registry with other engines in this process.
    pub fn with_locks(mut self, locks: WorktreeLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Accept `plan`, persist a new workflow, and drive it to its first pause.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn start(&self, plan: Plan, options: StartOptions) -> Result<WorkflowState> {
        let plan = accept_plan(&plan)
            .map_err(|errors| anyhow!("plan rejected:\n  - {}", errors.join("\n  - ")))?;
        let workflow_id = options.workflow_id.unwrap_or_else(generate_workflow_id);
        validate_workflow_id(&workflow_id)?;
        if WorkflowPaths::new(&self.state_root, &workflow_id)
            .state
            .exists()
        {
            bail!("workflow '{workflow_id}' already exists");
        }
        ensure_state_root(&self.state_root)?;

        let trust_level = options.trust_level.unwrap_or(self.config.trust_level);
        let mut state = WorkflowState::new(&workflow_id, plan, trust_level);
        write_state(&self.state_root, &state)?;
        info!(
            workflow_id = %workflow_id,
            trust_level = %trust_level,
            batches = state.plan.batches.len(),
            steps = state.plan.step_count(),
            "workflow started"
        );
        self.drive(&mut state)?;
        Ok(state)
    }

    /// Continue a workflow that was interrupted while executing.
    ///
    /// Paused workflows are returned unchanged; they move on through an
    /// approval or a blocker resolution instead.
    pub fn resume(&self, workflow_id: &str) -> Result<WorkflowState> {
        let mut state = load_state(&self.state_root, workflow_id)?;
        if state.status == WorkflowStatus::Executing {
            info!(
                workflow_id,
                batch = state.cursor.batch,
                step = state.cursor.step,
                "resuming workflow"
            );
            self.drive(&mut state)?;
        }
        Ok(state)
    }

    /// Record a decision on the batch awaiting approval.
    ///
    /// A rejection hands the feedback to the driver as a revision of the
    /// completed batch and then raises the same checkpoint again.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, approved = approved))]
    pub fn submit_approval(
        &self,
        workflow_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<WorkflowState> {
        let mut state = load_state(&self.state_root, workflow_id)?;
        let transition = record_approval(&mut state, approved, feedback, Utc::now())
            .map_err(|err| anyhow!(err))?;
        let batch = state
            .approvals
            .last()
            .map(|approval| approval.batch)
            .unwrap_or_default();
        write_state(&self.state_root, &state)?;

        if transition == Transition::Continue {
            self.sink
                .emit(workflow_id, &EngineEvent::ApprovalGranted { batch })?;
            self.drive(&mut state)?;
            return Ok(state);
        }

        let feedback = state.feedback.clone().unwrap_or_default();
        self.sink.emit(
            workflow_id,
            &EngineEvent::ApprovalRejected {
                batch,
                feedback: feedback.clone(),
            },
        )?;
        self.revise(&mut state, batch, &feedback)?;
        self.sink.emit(
            workflow_id,
            &approval_required(&state, batch),
        )?;
        Ok(state)
    }

    /// Apply a human resolution to the outstanding blocker.
    #[instrument(skip_all, fields(workflow_id = %workflow_id, resolution = resolution.as_str()))]
    pub fn resolve_blocker(
        &self,
        workflow_id: &str,
        resolution: Resolution,
    ) -> Result<WorkflowState> {
        let mut state = load_state(&self.state_root, workflow_id)?;
        let blocker = state
            .blocker
            .clone()
            .with_context(|| format!("workflow '{workflow_id}' has no blocker to resolve"))?;
        let transition = apply_resolution(&mut state, &resolution).map_err(|err| anyhow!(err))?;

        let mut reverted = false;
        match &resolution {
            Resolution::Fix { instruction } => {
                let step = state.plan.find_step(&blocker.step_id).with_context(|| {
                    format!("blocked step '{}' is not in the plan", blocker.step_id)
                })?;
                let prompt = self
                    .prompts
                    .render_fix(&state.plan.goal, step, &blocker, instruction)?;
                let cancel = self.cancel_token(workflow_id);
                let response = self.locks.with_worktree(&self.workdir, || {
                    self.context(&state.plan.goal, &cancel)
                        .call_driver(DriverPurpose::Fix, prompt)
                });
                if let Err(err) = response {
                    warn!(step_id = %blocker.step_id, error = %err, "fix hand-off failed");
                    let kind = if matches!(err, DriverError::Cancelled) {
                        cancel.reset()?;
                        BlockerKind::UserCancelled
                    } else {
                        BlockerKind::DriverFailure
                    };
                    let message = format!("fix for step '{}' failed: {err}", blocker.step_id);
                    let report = reblock_after_fix(&mut state, &blocker, instruction, kind, message);
                    write_state(&self.state_root, &state)?;
                    self.sink
                        .emit(workflow_id, &EngineEvent::BlockerRaised { report })?;
                    return Ok(state);
                }
                info!(step_id = %blocker.step_id, "driver applied fix");
            }
            Resolution::AbortRevert => {
                if let Some(snap) = state.snapshot.take() {
                    let git = Git::new(&self.workdir);
                    let report = self
                        .locks
                        .with_worktree(&self.workdir, || snapshot::restore(&git, &snap))
                        .context("revert batch changes")?;
                    info!(
                        reverted = report.reverted.len(),
                        removed = report.removed.len(),
                        "reverted batch changes"
                    );
                    reverted = true;
                }
            }
            Resolution::AbortKeep => {
                state.snapshot = None;
            }
            Resolution::Retry | Resolution::Skip => {}
        }
        write_state(&self.state_root, &state)?;
        self.sink.emit(
            workflow_id,
            &EngineEvent::BlockerResolved {
                step_id: blocker.step_id.clone(),
                resolution: resolution.as_str().to_string(),
            },
        )?;

        match transition {
            Transition::Continue => self.drive(&mut state)?,
            Transition::Finished if state.status == WorkflowStatus::Aborted => {
                warn!(workflow_id, step_id = %blocker.step_id, reverted, "workflow aborted");
                self.sink
                    .emit(workflow_id, &EngineEvent::WorkflowAborted { reverted })?;
            }
            _ => {}
        }
        Ok(state)
    }

    /// Persisted state of a workflow.
    pub fn status(&self, workflow_id: &str) -> Result<WorkflowState> {
        load_state(&self.state_root, workflow_id)
    }

    /// Files the in-flight batch has touched so far.
    pub fn changed_files(&self, workflow_id: &str) -> Result<Vec<String>> {
        let state = load_state(&self.state_root, workflow_id)?;
        let Some(snap) = state.snapshot else {
            return Ok(Vec::new());
        };
        let git = Git::new(&self.workdir);
        self.locks
            .with_worktree(&self.workdir, || snapshot::changed_since(&git, &snap))
    }

    /// Token that cancels the running step of `workflow_id`.
    pub fn cancel_handle(&self, workflow_id: &str) -> CancelToken {
        self.cancel_token(workflow_id)
    }

    /// Cancel the running step, in this process or another.
    pub fn cancel(&self, workflow_id: &str) -> Result<()> {
        validate_workflow_id(workflow_id)?;
        self.cancel_token(workflow_id).cancel();
        request_cancel(&WorkflowPaths::new(&self.state_root, workflow_id).cancel_marker)?;
        info!(workflow_id, "cancellation requested");
        Ok(())
    }

    fn cancel_token(&self, workflow_id: &str) -> CancelToken {
        let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        cancels
            .entry(workflow_id.to_string())
            .or_insert_with(|| {
                CancelToken::with_marker(
                    WorkflowPaths::new(&self.state_root, workflow_id).cancel_marker,
                )
            })
            .clone()
    }

    fn context<'a>(&'a self, goal: &'a str, cancel: &'a CancelToken) -> ExecContext<'a> {
        ExecContext {
            workdir: &self.workdir,
            goal,
            config: &self.config,
            driver: self.driver.as_ref(),
            prompts: &self.prompts,
            cancel,
        }
    }

    /// Run batches until the workflow pauses or ends.
    fn drive(&self, state: &mut WorkflowState) -> Result<()> {
        let cancel = self.cancel_token(&state.workflow_id);
        cancel.reset()?;
        self.locks
            .with_worktree(&self.workdir, || self.drive_locked(state, &cancel))
    }

    #[instrument(skip_all, fields(workflow_id = %state.workflow_id))]
    fn drive_locked(&self, state: &mut WorkflowState, cancel: &CancelToken) -> Result<()> {
        let git = Git::new(&self.workdir);
        let workflow_id = state.workflow_id.clone();
        while state.status == WorkflowStatus::Executing {
            if state.cursor.batch >= state.plan.batches.len() {
                state.status = WorkflowStatus::AllDone;
                write_state(&self.state_root, state)?;
                self.emit_completed(state)?;
                break;
            }

            let goal = state.plan.goal.clone();
            let ctx = self.context(&goal, cancel);
            let state_root = &self.state_root;
            let outcome = run_batch(&ctx, &git, state, self.sink.as_ref(), &mut |snapshot_state| {
                write_state(state_root, snapshot_state)
            })?;
            let finished_batch = outcome.result.batch;
            let transition = apply_batch_outcome(state, outcome);
            write_state(&self.state_root, state)?;

            match transition {
                Transition::Continue => {}
                Transition::AwaitApproval => {
                    info!(batch = finished_batch, "awaiting approval");
                    self.sink.emit(
                        &workflow_id,
                        &approval_required(state, finished_batch),
                    )?;
                }
                Transition::AwaitResolution => {
                    if let Some(blocker) = &state.blocker {
                        warn!(
                            step_id = %blocker.step_id,
                            kind = blocker.kind.as_str(),
                            "workflow blocked"
                        );
                        self.sink.emit(
                            &workflow_id,
                            &EngineEvent::BlockerRaised {
                                report: blocker.clone(),
                            },
                        )?;
                    }
                }
                Transition::Finished => {
                    if state.status == WorkflowStatus::AllDone {
                        self.emit_completed(state)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_completed(&self, state: &WorkflowState) -> Result<()> {
        info!(workflow_id = %state.workflow_id, "workflow complete");
        self.sink.emit(
            &state.workflow_id,
            &EngineEvent::WorkflowCompleted {
                batches: state.plan.batches.len(),
            },
        )
    }

    /// Hand rejection feedback to the driver for the batch that just completed.
    ///
    /// Feedback is cleared once the driver succeeds. A failed revision keeps
    /// it so the reviewer sees what is still outstanding.
    fn revise(&self, state: &mut WorkflowState, batch_number: u32, feedback: &str) -> Result<()> {
        let batch = state
            .plan
            .batches
            .iter()
            .find(|batch| batch.number == batch_number)
            .with_context(|| format!("batch {batch_number} is not in the plan"))?;
        let results = state
            .batch_results
            .iter()
            .rev()
            .find(|result| result.batch == batch_number)
            .map(|result| result.steps.as_slice())
            .unwrap_or_default();
        let prompt = self
            .prompts
            .render_revision(&state.plan.goal, batch, results, feedback)?;

        let cancel = self.cancel_token(&state.workflow_id);
        cancel.reset()?;
        let response = self.locks.with_worktree(&self.workdir, || {
            self.context(&state.plan.goal, &cancel)
                .call_driver(DriverPurpose::Revision, prompt)
        });
        match response {
            Ok(_) => {
                info!(batch = batch_number, "driver revised batch");
                state.feedback = None;
                write_state(&self.state_root, state)?;
            }
            Err(err) => {
                warn!(batch = batch_number, error = %err, "revision failed; feedback kept");
            }
        }
        Ok(())
    }
}

/// Checkpoint notice for `batch`, carrying the risk of the batch that waits.
fn approval_required(state: &WorkflowState, batch: u32) -> EngineEvent {
    let next = state.plan.batches.get(state.cursor.batch);
    EngineEvent::ApprovalRequired {
        batch,
        next_batch: next.map(|next| next.number).unwrap_or_default(),
        risk: next.map(Batch::risk_summary).unwrap_or(RiskLevel::Low),
    }
}

/// `wf-<UTC timestamp>-<6 random lowercase alphanumerics>`.
pub fn generate_workflow_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("wf-{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BatchStatus, StepStatus};
    use crate::io::state_store::list_workflows;
    use crate::test_support::{
        RecordingSink, ScriptedDriver, TestRepo, batch, depends_on, final_result, plan,
        shell_step, step_with_risk, verdict,
    };

    fn engine(repo: &TestRepo, driver: ScriptedDriver, sink: &RecordingSink) -> Engine {
        let mut config = EngineConfig::default();
        config.driver.base_delay_ms = 0;
        config.poll_interval_ms = 20;
        Engine::new(
            repo.path(),
            repo.path().join(".conductor"),
            config,
            Arc::new(driver),
            Arc::new(sink.clone()),
        )
    }

    fn options(id: &str) -> StartOptions {
        StartOptions {
            workflow_id: Some(id.to_string()),
            trust_level: None,
        }
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = generate_workflow_id();
        assert!(id.starts_with("wf-"));
        validate_workflow_id(&id).expect("valid id");
        assert_eq!(id.rsplit('-').next().map(str::len), Some(6));
    }

    #[test]
    fn rejected_plan_is_not_persisted() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        let bad = plan(vec![batch(
            1,
            vec![shell_step("a", "true"), shell_step("a", "true")],
        )]);
        let err = engine.start(bad, options("wf-bad")).expect_err("duplicate ids");
        assert!(err.to_string().contains("plan rejected"));
        assert!(list_workflows(&repo.path().join(".conductor")).expect("list").is_empty());
        assert!(sink.names().is_empty());
    }

    #[test]
    fn standard_trust_pauses_after_each_batch() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        let state = engine
            .start(
                plan(vec![
                    batch(1, vec![shell_step("a", "touch a.txt")]),
                    batch(2, vec![shell_step("b", "touch b.txt")]),
                ]),
                options("wf-std"),
            )
            .expect("start");
        assert_eq!(state.status, WorkflowStatus::BatchComplete);
        assert!(repo.path().join("a.txt").exists());
        assert!(!repo.path().join("b.txt").exists());
        assert_eq!(sink.names().last().map(String::as_str), Some("approval_required"));

        let state = engine
            .submit_approval("wf-std", true, None)
            .expect("approve");
        assert_eq!(state.status, WorkflowStatus::AllDone);
        assert!(repo.path().join("b.txt").exists());
        assert_eq!(engine.status("wf-std").expect("status"), state);
    }

    #[test]
    fn rejection_sends_feedback_to_driver_and_asks_again() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let driver = ScriptedDriver::new(vec![Ok(final_result("renamed the file"))]);
        let engine = engine(&repo, driver.clone(), &sink);
        engine
            .start(
                plan(vec![
                    batch(1, vec![shell_step("a", "touch a.txt")]),
                    batch(2, vec![shell_step("b", "true")]),
                ]),
                options("wf-rej"),
            )
            .expect("start");

        let state = engine
            .submit_approval("wf-rej", false, Some("use snake_case names".to_string()))
            .expect("reject");
        assert_eq!(state.status, WorkflowStatus::BatchComplete);
        assert_eq!(state.feedback, None);
        assert_eq!(driver.purposes(), vec![DriverPurpose::Revision]);
        assert!(driver.requests()[0].prompt.contains("use snake_case names"));
        let names = sink.names();
        assert_eq!(
            &names[names.len() - 2..],
            &["approval_rejected".to_string(), "approval_required".to_string()]
        );
        assert_eq!(state.approvals.len(), 1);
        assert!(!state.approvals[0].approved);
    }

    #[test]
    fn approval_is_refused_when_not_paused() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        engine
            .start(
                plan(vec![batch(1, vec![shell_step("a", "exit 3")])]),
                options("wf-blk"),
            )
            .expect("start");
        let err = engine
            .submit_approval("wf-blk", true, None)
            .expect_err("blocked, not paused");
        assert!(err.to_string().contains("not awaiting approval"));
    }

    #[test]
    fn skip_resolution_cascades_and_finishes() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        let dependent = depends_on(shell_step("b", "touch b.txt"), &["a"]);
        let state = engine
            .start(
                plan(vec![batch(
                    1,
                    vec![shell_step("a", "exit 1"), dependent, shell_step("c", "touch c.txt")],
                )]),
                options("wf-skip"),
            )
            .expect("start");
        assert_eq!(state.status, WorkflowStatus::Blocked);
        let blocker = state.blocker.as_ref().expect("blocker");
        assert_eq!(blocker.kind, BlockerKind::ExecutionFailure);
        assert_eq!(blocker.cascade_preview, vec!["b"]);

        let state = engine
            .resolve_blocker("wf-skip", Resolution::Skip)
            .expect("skip");
        assert_eq!(state.status, WorkflowStatus::AllDone);
        let last = state.batch_results.last().expect("result");
        assert_eq!(last.status, BatchStatus::Complete);
        let statuses: Vec<StepStatus> = last.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Skipped, StepStatus::Skipped, StepStatus::Completed]
        );
        assert!(!repo.path().join("b.txt").exists());
        assert!(repo.path().join("c.txt").exists());
    }

    #[test]
    fn abort_keep_leaves_changes_in_place() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        engine
            .start(
                plan(vec![batch(
                    1,
                    vec![shell_step("a", "touch a.txt"), shell_step("b", "exit 1")],
                )]),
                options("wf-keep"),
            )
            .expect("start");
        assert_eq!(
            engine.changed_files("wf-keep").expect("changes"),
            vec!["a.txt".to_string()]
        );
        let state = engine
            .resolve_blocker("wf-keep", Resolution::AbortKeep)
            .expect("abort");
        assert_eq!(state.status, WorkflowStatus::Aborted);
        assert_eq!(
            state.batch_results.last().map(|result| result.status),
            Some(BatchStatus::Partial)
        );
        assert!(repo.path().join("a.txt").exists());
        assert_eq!(sink.names().last().map(String::as_str), Some("workflow_aborted"));
    }

    #[test]
    fn failed_fix_hand_off_raises_a_new_blocker() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let timeout = || Err(DriverError::Transient("timeout".to_string()));
        let driver = ScriptedDriver::new(vec![timeout(), timeout(), timeout()]);
        let engine = engine(&repo, driver.clone(), &sink);
        engine
            .start(
                plan(vec![batch(
                    1,
                    vec![
                        shell_step("a", "exit 1"),
                        depends_on(shell_step("b", "true"), &["a"]),
                    ],
                )]),
                options("wf-fixfail"),
            )
            .expect("start");

        let state = engine
            .resolve_blocker(
                "wf-fixfail",
                Resolution::Fix {
                    instruction: "create the missing file".to_string(),
                },
            )
            .expect("failed fix is reported, not returned as an error");
        assert_eq!(state.status, WorkflowStatus::Blocked);
        assert_eq!(driver.calls(), 3);
        let blocker = state.blocker.clone().expect("blocker");
        assert_eq!(blocker.kind, BlockerKind::DriverFailure);
        assert!(blocker.message.contains("timeout"));
        assert_eq!(
            blocker.attempted,
            vec!["exit 1", "fix: create the missing file"]
        );
        assert!(state.skipped.contains_key("b"));
        assert_eq!(engine.status("wf-fixfail").expect("status"), state);
        assert!(matches!(
            sink.events().last().map(|(_, event)| event.clone()),
            Some(EngineEvent::BlockerRaised { report }) if report == blocker
        ));
    }

    /// Cancelling a running step kills it, cascades to dependents and
    /// leaves a user-cancelled blocker.
    #[test]
    fn cancelling_a_running_step_blocks_as_user_cancelled() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        let handle = engine.cancel_handle("wf-cancel");
        let state = std::thread::scope(|scope| {
            let run = scope.spawn(|| {
                engine.start(
                    plan(vec![
                        batch(
                            1,
                            vec![
                                shell_step("slow", "sleep 30"),
                                depends_on(shell_step("after", "touch after.txt"), &["slow"]),
                            ],
                        ),
                        batch(2, vec![depends_on(shell_step("later", "true"), &["after"])]),
                    ]),
                    options("wf-cancel"),
                )
            });
            while !sink.names().iter().any(|name| name == "step_started") {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
            handle.cancel();
            run.join().expect("workflow thread")
        })
        .expect("start");

        assert_eq!(state.status, WorkflowStatus::Blocked);
        let blocker = state.blocker.clone().expect("blocker");
        assert_eq!(blocker.kind, BlockerKind::UserCancelled);
        assert_eq!(blocker.step_id, "slow");
        let slow = &state.batch_results[0].steps[0];
        assert_eq!(slow.status, StepStatus::Cancelled);
        assert!(slow.cancelled_by_user);
        assert!(slow.duration_ms < 30_000);
        assert!(state.skipped.contains_key("after"));
        assert!(state.skipped.contains_key("later"));
        assert!(!repo.path().join("after.txt").exists());
        assert!(!handle.is_cancelled());
        assert!(sink.names().iter().any(|name| name == "step_cancelled"));
    }

    #[test]
    fn resolving_without_blocker_fails() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        engine
            .start(
                plan(vec![batch(1, vec![shell_step("a", "true")])]),
                options("wf-done"),
            )
            .expect("start");
        let err = engine
            .resolve_blocker("wf-done", Resolution::Retry)
            .expect_err("nothing to resolve");
        assert!(err.to_string().contains("no blocker"));
    }

    #[test]
    fn high_risk_step_rejected_by_driver_blocks_before_running() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let driver = ScriptedDriver::new(vec![Ok(verdict(false, Some("would drop the table")))]);
        let engine = engine(&repo, driver, &sink);
        let state = engine
            .start(
                plan(vec![batch(
                    1,
                    vec![step_with_risk(shell_step("a", "touch a.txt"), RiskLevel::High)],
                )]),
                options("wf-high"),
            )
            .expect("start");
        let blocker = state.blocker.expect("blocker");
        assert_eq!(blocker.kind, BlockerKind::ValidationFailure);
        assert_eq!(blocker.message, "would drop the table");
        assert!(!repo.path().join("a.txt").exists());
    }

    #[test]
    fn cancel_marker_is_cleared_when_driving_starts() {
        let repo = TestRepo::new(&[("README.md", "readme\n")]);
        let sink = RecordingSink::default();
        let engine = engine(&repo, ScriptedDriver::new(Vec::new()), &sink);
        engine.cancel("wf-stale").expect("cancel");
        let state = engine
            .start(
                plan(vec![batch(1, vec![shell_step("a", "true")])]),
                options("wf-stale"),
            )
            .expect("start");
        assert_eq!(state.status, WorkflowStatus::AllDone);
        assert!(!engine.cancel_handle("wf-stale").is_cancelled());
    }
}
