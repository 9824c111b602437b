//! Step execution with fallback strategies.
//!
//! Shell steps try their primary command and then each declared fallback,
//! stopping at the first that passes. Code-edit steps apply their change
//! directly or through the driver. Side effects of failed attempts are left
//! in place; reverting is the snapshot manager's job.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::context::ExecContext;
use crate::core::command_check::validate_command_result;
use crate::core::truncate::truncate_output;
use crate::core::types::{StepResult, StepStatus};
use crate::io::driver::{DriverError, DriverPurpose, final_text};
use crate::io::edit::{apply_change, resolve_in_root};
use crate::io::process::{CommandOutput, run_command, shell_command};
use crate::plan::{FileChange, Step, StepAction, StepValidation};

/// Result of executing one step, with every attempt in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExecution {
    pub result: StepResult,
    /// Actions tried, primary first.
    pub attempted: Vec<String>,
    /// Why the last attempt failed; empty on success.
    pub message: String,
}

/// Outcome of one attempt.
enum Attempt {
    Passed { output: String },
    Failed { output: String, reason: String },
    Cancelled { output: String },
}

/// Execute a step, falling back through its alternates.
#[instrument(skip_all, fields(step_id = %step.id))]
pub fn execute(ctx: &ExecContext<'_>, step: &Step) -> Result<StepExecution> {
    let started = Instant::now();
    let (attempted, last) = match &step.action {
        StepAction::Shell {
            command,
            workdir,
            fallbacks,
        } => {
            let dir = match workdir {
                Some(relative) => resolve_in_root(ctx.workdir, relative)?,
                None => ctx.workdir.to_path_buf(),
            };
            run_shell_candidates(ctx, step, command, fallbacks, &dir)?
        }
        StepAction::CodeEdit { file, change } => {
            let label = step.action_label();
            let attempt = run_code_edit(ctx, step, file, change)?;
            (vec![label], attempt)
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let command = attempted.last().cloned();
    let (status, output, error, message, cancelled_by_user) = match last {
        Attempt::Passed { output } => (
            StepStatus::Completed,
            output,
            String::new(),
            String::new(),
            false,
        ),
        Attempt::Failed { output, reason } => {
            let message = if attempted.len() > 1 {
                format!("all {} attempts failed; last: {reason}", attempted.len())
            } else {
                reason
            };
            (StepStatus::Failed, output, message.clone(), message, false)
        }
        Attempt::Cancelled { output } => {
            let message = "cancelled by user".to_string();
            (StepStatus::Cancelled, output, message.clone(), message, true)
        }
    };

    info!(status = ?status, attempts = attempted.len(), duration_ms, "step finished");
    Ok(StepExecution {
        result: StepResult {
            step_id: step.id.clone(),
            status,
            output: truncate_output(&output),
            error: truncate_output(&error),
            command,
            duration_ms,
            cancelled_by_user,
        },
        attempted,
        message,
    })
}

fn run_shell_candidates(
    ctx: &ExecContext<'_>,
    step: &Step,
    primary: &str,
    fallbacks: &[String],
    dir: &Path,
) -> Result<(Vec<String>, Attempt)> {
    let candidates = std::iter::once(primary).chain(fallbacks.iter().map(String::as_str));
    let mut attempted = Vec::new();
    let mut last = Attempt::Failed {
        output: String::new(),
        reason: "no command to run".to_string(),
    };

    for candidate in candidates {
        if ctx.cancel.is_cancelled() {
            return Ok((attempted, Attempt::Cancelled { output: String::new() }));
        }
        attempted.push(candidate.to_string());
        debug!(command = candidate, attempt = attempted.len(), "running candidate");
        let out = run_command(
            shell_command(candidate, dir),
            None,
            &ctx.config.command_limits(),
            Some(ctx.cancel),
        )?;
        let output = combined_output(&out);
        if out.cancelled {
            return Ok((attempted, Attempt::Cancelled { output }));
        }

        let verdict = match validate_command_result(
            out.exit_code(),
            &out.stdout_text(),
            &step.validation,
        ) {
            Ok(verdict) => verdict,
            // A bad pattern fails every candidate the same way.
            Err(reason) => return Ok((attempted, Attempt::Failed { output, reason })),
        };
        if !verdict.is_pass() {
            warn!(command = candidate, reason = %verdict.describe(), "candidate failed");
            last = Attempt::Failed {
                output,
                reason: format!("`{candidate}`: {}", verdict.describe()),
            };
            continue;
        }

        match &step.validation.command {
            None => return Ok((attempted, Attempt::Passed { output })),
            Some(check) => match run_validation_command(
                ctx,
                check,
                dir,
                &StepValidation::default(),
            )? {
                Attempt::Passed { output: check_output } => {
                    return Ok((
                        attempted,
                        Attempt::Passed {
                            output: join_sections(&output, &check_output),
                        },
                    ));
                }
                Attempt::Cancelled { output: check_output } => {
                    return Ok((
                        attempted,
                        Attempt::Cancelled {
                            output: join_sections(&output, &check_output),
                        },
                    ));
                }
                Attempt::Failed {
                    output: check_output,
                    reason,
                } => {
                    warn!(command = candidate, reason = %reason, "validation command failed");
                    last = Attempt::Failed {
                        output: join_sections(&output, &check_output),
                        reason: format!("`{candidate}`: {reason}"),
                    };
                }
            },
        }
    }
    Ok((attempted, last))
}

fn run_code_edit(
    ctx: &ExecContext<'_>,
    step: &Step,
    file: &Path,
    change: &FileChange,
) -> Result<Attempt> {
    let summary = match change {
        FileChange::Instruct { instruction } => {
            let prompt = ctx.prompts.render_edit(
                ctx.goal,
                step,
                &file.display().to_string(),
                instruction,
            )?;
            match ctx.call_driver(DriverPurpose::Edit, prompt) {
                Ok(messages) => final_text(&messages).unwrap_or_default().to_string(),
                Err(DriverError::Cancelled) => {
                    return Ok(Attempt::Cancelled {
                        output: String::new(),
                    });
                }
                Err(err) => {
                    return Ok(Attempt::Failed {
                        output: String::new(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        direct => match apply_change(ctx.workdir, file, direct) {
            Ok(summary) => summary,
            Err(err) => {
                return Ok(Attempt::Failed {
                    output: String::new(),
                    reason: format!("{err:#}"),
                });
            }
        },
    };

    let Some(check) = &step.validation.command else {
        return Ok(Attempt::Passed { output: summary });
    };
    Ok(
        match run_validation_command(ctx, check, ctx.workdir, &step.validation)? {
            Attempt::Passed { output } => Attempt::Passed {
                output: join_sections(&summary, &output),
            },
            Attempt::Failed { output, reason } => Attempt::Failed {
                output: join_sections(&summary, &output),
                reason: format!("validation `{check}`: {reason}"),
            },
            Attempt::Cancelled { output } => Attempt::Cancelled {
                output: join_sections(&summary, &output),
            },
        },
    )
}

/// Run a validation command and judge it against `criteria`.
fn run_validation_command(
    ctx: &ExecContext<'_>,
    command: &str,
    dir: &Path,
    criteria: &StepValidation,
) -> Result<Attempt> {
    let out = run_command(
        shell_command(command, dir),
        None,
        &ctx.config.command_limits(),
        Some(ctx.cancel),
    )?;
    let output = combined_output(&out);
    if out.cancelled {
        return Ok(Attempt::Cancelled { output });
    }
    Ok(
        match validate_command_result(out.exit_code(), &out.stdout_text(), criteria) {
            Ok(verdict) if verdict.is_pass() => Attempt::Passed { output },
            Ok(verdict) => Attempt::Failed {
                output,
                reason: verdict.describe(),
            },
            Err(reason) => Attempt::Failed { output, reason },
        },
    )
}

fn combined_output(out: &CommandOutput) -> String {
    join_sections(&out.stdout_text(), &out.stderr_text())
}

fn join_sections(first: &str, second: &str) -> String {
    match (first.trim_end().is_empty(), second.trim_end().is_empty()) {
        (true, _) => second.to_string(),
        (_, true) => first.to_string(),
        _ => format!("{}\n{}", first.trim_end(), second),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::cancel::CancelToken;
    use crate::io::config::EngineConfig;
    use crate::io::prompt::PromptEngine;
    use crate::test_support::{ScriptedDriver, code_edit_step, final_result, shell_step};

    struct Harness {
        temp: tempfile::TempDir,
        config: EngineConfig,
        prompts: PromptEngine,
        cancel: CancelToken,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = EngineConfig::default();
            config.driver.base_delay_ms = 0;
            config.command_timeout_secs = 30;
            config.poll_interval_ms = 20;
            Self {
                temp: tempfile::tempdir().expect("tempdir"),
                config,
                prompts: PromptEngine::new(),
                cancel: CancelToken::new(),
            }
        }

        fn ctx<'a>(&'a self, driver: &'a ScriptedDriver) -> ExecContext<'a> {
            ExecContext {
                workdir: self.temp.path(),
                goal: "test goal",
                config: &self.config,
                driver,
                prompts: &self.prompts,
                cancel: &self.cancel,
            }
        }
    }

    fn with_fallbacks(mut step: Step, extra: &[&str]) -> Step {
        if let StepAction::Shell { fallbacks, .. } = &mut step.action {
            *fallbacks = extra.iter().map(|s| s.to_string()).collect();
        }
        step
    }

    #[test]
    fn primary_success_skips_fallbacks() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let step = with_fallbacks(shell_step("a", "echo primary"), &["echo fallback"]);
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Completed);
        assert_eq!(exec.attempted, vec!["echo primary"]);
        assert_eq!(exec.result.command.as_deref(), Some("echo primary"));
        assert_eq!(exec.result.output, "primary\n");
    }

    #[test]
    fn first_passing_fallback_wins() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let step = with_fallbacks(
            shell_step("a", "exit 1"),
            &["exit 2", "echo ok", "echo never"],
        );
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Completed);
        assert_eq!(exec.attempted, vec!["exit 1", "exit 2", "echo ok"]);
        assert_eq!(exec.result.command.as_deref(), Some("echo ok"));
    }

    #[test]
    fn all_candidates_failing_records_every_attempt() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let step = with_fallbacks(shell_step("a", "exit 1"), &["exit 2", "exit 3"]);
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Failed);
        assert_eq!(exec.attempted.len(), 3);
        assert!(exec.message.starts_with("all 3 attempts failed"));
        assert!(exec.message.contains("exit code 3 (expected 0)"));
    }

    /// Exit code mismatch fails the step even when the output pattern matches.
    #[test]
    fn exit_code_is_authoritative_over_pattern() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let mut step = shell_step("a", "echo '3 passed'; exit 1");
        step.validation.output_pattern = Some(r"\d+ passed".to_string());
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Failed);
    }

    #[test]
    fn declared_validation_command_must_exit_zero() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let mut step = shell_step("a", "touch made.txt");
        step.validation.command = Some("test -f missing.txt".to_string());
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Failed);
        assert!(h.temp.path().join("made.txt").exists());
    }

    #[test]
    fn code_edit_write_then_validation_pattern() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let mut step = code_edit_step("e", "a.py", "print('hello')\n");
        step.validation.command = Some("cat a.py".to_string());
        step.validation.output_pattern = Some("hello".to_string());
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Completed);
        assert_eq!(exec.attempted, vec!["write a.py"]);
        assert!(exec.result.output.contains("wrote 15 bytes to a.py"));
    }

    #[test]
    fn instruct_edit_goes_through_driver() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(vec![Ok(final_result("added docstring"))]);
        let mut step = code_edit_step("e", "a.py", "");
        if let StepAction::CodeEdit { change, .. } = &mut step.action {
            *change = FileChange::Instruct {
                instruction: "add a docstring".to_string(),
            };
        }
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Completed);
        assert_eq!(exec.result.output, "added docstring");
        assert_eq!(driver.purposes(), vec![DriverPurpose::Edit]);
    }

    #[test]
    fn cancelled_token_stops_before_running() {
        let h = Harness::new();
        h.cancel.cancel();
        let driver = ScriptedDriver::new(Vec::new());
        let step = with_fallbacks(shell_step("a", "touch ran.txt"), &["touch ran2.txt"]);
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert_eq!(exec.result.status, StepStatus::Cancelled);
        assert!(exec.result.cancelled_by_user);
        assert!(exec.attempted.is_empty());
        assert!(!h.temp.path().join("ran.txt").exists());
    }

    #[test]
    fn long_output_is_truncated() {
        let h = Harness::new();
        let driver = ScriptedDriver::new(Vec::new());
        let step = shell_step("a", "seq 1 500");
        let exec = execute(&h.ctx(&driver), &step).expect("execute");
        assert!(exec.result.output.lines().count() <= 100);
        assert!(exec.result.output.ends_with("500"));
    }
}
