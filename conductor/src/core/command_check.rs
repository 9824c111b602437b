//! Success criteria for executed commands.

use std::sync::LazyLock;

use regex::Regex;

use crate::plan::StepValidation;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ansi escape regex should be valid")
});

/// Verdict for one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Pass,
    /// `actual` is `None` when the process was killed by a signal.
    ExitCodeMismatch { expected: i32, actual: Option<i32> },
    PatternMismatch { pattern: String },
}

impl CommandVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, CommandVerdict::Pass)
    }

    pub fn describe(&self) -> String {
        match self {
            CommandVerdict::Pass => "passed".to_string(),
            CommandVerdict::ExitCodeMismatch { expected, actual } => match actual {
                Some(code) => format!("exit code {code} (expected {expected})"),
                None => format!("terminated by signal (expected exit code {expected})"),
            },
            CommandVerdict::PatternMismatch { pattern } => {
                format!("output did not match /{pattern}/")
            }
        }
    }
}

/// Remove ANSI escape sequences (colors, cursor movement, OSC titles).
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Judge a command result against a step's validation settings.
///
/// The exit code is checked first and is authoritative. Only when it matches
/// and an output pattern is declared is stdout (ANSI-stripped) matched.
/// Returns an error only for an invalid pattern.
pub fn validate_command_result(
    exit_code: Option<i32>,
    stdout: &str,
    validation: &StepValidation,
) -> Result<CommandVerdict, String> {
    if exit_code != Some(validation.expected_exit_code) {
        return Ok(CommandVerdict::ExitCodeMismatch {
            expected: validation.expected_exit_code,
            actual: exit_code,
        });
    }
    let Some(pattern) = validation.output_pattern.as_deref() else {
        return Ok(CommandVerdict::Pass);
    };
    let compiled =
        Regex::new(pattern).map_err(|err| format!("invalid output pattern /{pattern}/: {err}"))?;
    if compiled.is_match(&strip_ansi(stdout)) {
        Ok(CommandVerdict::Pass)
    } else {
        Ok(CommandVerdict::PatternMismatch {
            pattern: pattern.to_string(),
        })
    }
}
