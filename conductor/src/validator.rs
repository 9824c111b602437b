//! Tiered pre-execution validation.
//!
//! Every step gets cheap filesystem checks. Steps with high risk, or that
//! ask for human judgment, also get a semantic check through the driver.
//! Medium-risk batches get one semantic review for the whole batch before
//! their first step runs.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::context::ExecContext;
use crate::core::types::{BlockerKind, WorkflowState};
use crate::io::driver::{DriverError, DriverMessage, DriverPurpose, parse_verdict};
use crate::io::edit::resolve_in_root;
use crate::plan::{Batch, FileChange, RiskLevel, Step, StepAction};

/// Words `sh` resolves without a `PATH` lookup.
const SHELL_BUILTINS: &[&str] = &[
    "!", ".", ":", "[", "alias", "break", "case", "cd", "command", "continue", "echo", "eval",
    "exec", "exit", "export", "false", "for", "if", "kill", "local", "printf", "pwd", "read",
    "return", "set", "shift", "source", "test", "times", "trap", "true", "type", "ulimit",
    "umask", "unset", "until", "wait", "while",
];

/// Outcome of validating a step or batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub issue: Option<String>,
    /// Checks that ran, in order.
    pub attempted: Vec<String>,
    pub suggestions: Vec<String>,
    /// Blocker class when not ok.
    pub kind: Option<BlockerKind>,
}

impl ValidationResult {
    fn passed(attempted: Vec<String>) -> Self {
        Self {
            ok: true,
            issue: None,
            attempted,
            suggestions: Vec::new(),
            kind: None,
        }
    }

    fn failed(
        kind: BlockerKind,
        issue: String,
        attempted: Vec<String>,
        suggestions: Vec<String>,
    ) -> Self {
        Self {
            ok: false,
            issue: Some(issue),
            attempted,
            suggestions,
            kind: Some(kind),
        }
    }
}

/// True if the step needs a semantic check before it runs.
pub fn needs_semantic_check(step: &Step) -> bool {
    step.risk() == RiskLevel::High || step.hints.requires_human_judgment
}

/// True if the batch gets one semantic review before its first step.
pub fn needs_batch_review(batch: &Batch) -> bool {
    batch.risk_summary() == RiskLevel::Medium
}

/// Validate one step before execution.
#[instrument(skip_all, fields(step_id = %step.id, risk = %step.risk()))]
pub fn validate(
    ctx: &ExecContext<'_>,
    step: &Step,
    state: &WorkflowState,
) -> Result<ValidationResult> {
    let mut attempted = vec!["filesystem".to_string()];
    if let Err(issue) = check_filesystem(ctx.workdir, step) {
        debug!(issue = %issue, "filesystem check failed");
        let suggestions = filesystem_suggestions(step);
        return Ok(ValidationResult::failed(
            BlockerKind::ValidationFailure,
            issue,
            attempted,
            suggestions,
        ));
    }
    if !needs_semantic_check(step) {
        return Ok(ValidationResult::passed(attempted));
    }

    attempted.push("semantic".to_string());
    let completed = state.completed_step_ids();
    let prompt = ctx
        .prompts
        .render_step_validation(ctx.goal, step, &completed)?;
    Ok(semantic_result(
        ctx.call_driver(DriverPurpose::StepValidation, prompt),
        attempted,
    ))
}

/// Semantic review of a whole batch.
#[instrument(skip_all, fields(batch = batch.number))]
pub fn review_batch(ctx: &ExecContext<'_>, batch: &Batch) -> Result<ValidationResult> {
    let prompt = ctx.prompts.render_batch_review(ctx.goal, batch)?;
    Ok(semantic_result(
        ctx.call_driver(DriverPurpose::BatchReview, prompt),
        vec!["batch review".to_string()],
    ))
}

fn semantic_result(
    response: Result<Vec<DriverMessage>, DriverError>,
    attempted: Vec<String>,
) -> ValidationResult {
    let verdict = response.and_then(|messages| parse_verdict(&messages));
    match verdict {
        Ok(verdict) if verdict.approved => ValidationResult::passed(attempted),
        Ok(verdict) => ValidationResult::failed(
            BlockerKind::ValidationFailure,
            verdict
                .issue
                .unwrap_or_else(|| "rejected by semantic validation".to_string()),
            attempted,
            verdict.suggestions,
        ),
        Err(DriverError::Cancelled) => ValidationResult::failed(
            BlockerKind::UserCancelled,
            "cancelled during semantic validation".to_string(),
            attempted,
            Vec::new(),
        ),
        Err(err) => {
            warn!(err = %err, "semantic validation unavailable");
            ValidationResult::failed(
                BlockerKind::DriverFailure,
                format!("semantic validation failed: {err}"),
                attempted,
                vec!["retry once the driver is reachable".to_string()],
            )
        }
    }
}

/// Cheap local checks. Returns the first problem found.
fn check_filesystem(workdir: &Path, step: &Step) -> Result<(), String> {
    match &step.action {
        StepAction::CodeEdit { file, change } => {
            let path = resolve_in_root(workdir, file).map_err(|err| format!("{err:#}"))?;
            let target = match change {
                FileChange::Replace { .. } if !path.is_file() => {
                    Err(format!("file to edit does not exist: {}", file.display()))
                }
                FileChange::Write { .. } if path.is_dir() => {
                    Err(format!("target is a directory: {}", file.display()))
                }
                FileChange::Instruct { .. }
                    if !path.is_file() && !path.parent().is_some_and(Path::is_dir) =>
                {
                    Err(format!(
                        "neither {} nor its parent directory exists",
                        file.display()
                    ))
                }
                _ => Ok(()),
            };
            target?;
            if let Some(command) = &step.validation.command {
                check_command(command, workdir)?;
            }
            Ok(())
        }
        StepAction::Shell {
            command,
            workdir: step_dir,
            ..
        } => {
            let dir = match step_dir {
                Some(relative) => {
                    let dir =
                        resolve_in_root(workdir, relative).map_err(|err| format!("{err:#}"))?;
                    if !dir.is_dir() {
                        return Err(format!(
                            "working directory does not exist: {}",
                            relative.display()
                        ));
                    }
                    dir
                }
                None => workdir.to_path_buf(),
            };
            check_command(command, &dir)?;
            if let Some(validation) = &step.validation.command {
                check_command(validation, &dir)?;
            }
            Ok(())
        }
    }
}

fn check_command(command: &str, dir: &Path) -> Result<(), String> {
    let Some(program) = command_program(command) else {
        return Err("command is empty".to_string());
    };
    if SHELL_BUILTINS.contains(&program.as_str()) {
        return Ok(());
    }
    if program.contains('/') {
        let path = dir.join(&program);
        return if path.is_file() {
            Ok(())
        } else {
            Err(format!("executable not found: {program}"))
        };
    }
    if find_on_path(&program).is_some() {
        Ok(())
    } else {
        Err(format!("executable not found on PATH: {program}"))
    }
}

/// First word of a shell command, skipping `VAR=value` prefixes and
/// opening subshell or group brackets.
fn command_program(command: &str) -> Option<String> {
    command
        .split_whitespace()
        .map(|token| token.trim_start_matches(['(', '{']))
        .find(|token| !token.is_empty() && !is_env_assignment(token))
        .map(|token| token.trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|token| !token.is_empty())
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn filesystem_suggestions(step: &Step) -> Vec<String> {
    match &step.action {
        StepAction::CodeEdit { file, .. } => vec![format!(
            "create {} or correct the path in the plan",
            file.display()
        )],
        StepAction::Shell { .. } => vec![
            "install the missing tool or add it to PATH".to_string(),
            "fix the command with an instruction for the driver".to_string(),
        ],
    }
}
