//! LLM driver boundary.
//!
//! The [`Driver`] trait decouples the engine from the agent backend. A driver
//! call returns the ordered message stream of one agent turn. Errors are
//! classified so the engine can retry transient failures with backoff and
//! surface permanent ones as blockers. Tests use scripted drivers that
//! return predetermined messages without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::cancel::CancelToken;
use crate::io::config::DriverConfig;
use crate::io::process::{RunLimits, stream_command_lines};

/// What a driver call is for; forwarded to the agent command as
/// `CONDUCTOR_PURPOSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverPurpose {
    StepValidation,
    BatchReview,
    Edit,
    Fix,
    Revision,
}

impl DriverPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverPurpose::StepValidation => "step_validation",
            DriverPurpose::BatchReview => "batch_review",
            DriverPurpose::Edit => "edit",
            DriverPurpose::Fix => "fix",
            DriverPurpose::Revision => "revision",
        }
    }
}

/// One agent turn.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub workdir: PathBuf,
    pub purpose: DriverPurpose,
    pub prompt: String,
    /// Token of the workflow making the call.
    pub cancel: Option<CancelToken>,
}

/// Message emitted by the agent during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    ToolCall {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Text {
        text: String,
    },
    FinalResult {
        result: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Timeouts, dropped connections, rate limits. Safe to retry.
    #[error("transient driver failure: {0}")]
    Transient(String),
    #[error("driver failure: {0}")]
    Permanent(String),
    #[error("driver call cancelled")]
    Cancelled,
}

/// Abstraction over agent backends.
pub trait Driver: Send + Sync {
    fn run(&self, request: &DriverRequest) -> Result<Vec<DriverMessage>, DriverError>;
}

/// Retry schedule for transient driver failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DriverConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }

    /// Delay before retry number `retries_used + 1`: `base * 2^retries_used`.
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let multiplier = 1u128 << retries_used.min(20);
        let millis = u64::try_from(base_ms.saturating_mul(multiplier)).unwrap_or(u64::MAX);
        Duration::from_millis(millis)
    }
}

/// Call the driver, retrying transient failures with exponential backoff.
///
/// Permanent errors and cancellation are returned immediately.
#[instrument(skip_all, fields(purpose = request.purpose.as_str(), max_attempts = policy.max_attempts))]
pub fn call_with_retry(
    driver: &dyn Driver,
    request: &DriverRequest,
    policy: &RetryPolicy,
) -> Result<Vec<DriverMessage>, DriverError> {
    let mut retries_used = 0u32;
    loop {
        match driver.run(request) {
            Ok(messages) => {
                debug!(messages = messages.len(), retries_used, "driver call succeeded");
                return Ok(messages);
            }
            Err(DriverError::Transient(message)) => {
                let attempts = retries_used + 1;
                if attempts >= policy.max_attempts {
                    warn!(attempts, "driver retries exhausted");
                    return Err(DriverError::Transient(format!(
                        "{message} (retry exhausted after {attempts} attempt(s))"
                    )));
                }
                let delay = policy.backoff(retries_used);
                warn!(
                    message = %message,
                    retry_attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "retrying driver call after transient error"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if request.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                    return Err(DriverError::Cancelled);
                }
                retries_used += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

/// The agent's final answer: the last `final_result`, else the last `text`.
pub fn final_text(messages: &[DriverMessage]) -> Option<&str> {
    let final_result = messages.iter().rev().find_map(|message| match message {
        DriverMessage::FinalResult { result, .. } => Some(result.as_str()),
        _ => None,
    });
    final_result.or_else(|| {
        messages.iter().rev().find_map(|message| match message {
            DriverMessage::Text { text } => Some(text.as_str()),
            _ => None,
        })
    })
}

/// Structured answer to a semantic validation or review prompt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SemanticVerdict {
    pub approved: bool,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Extract a [`SemanticVerdict`] from the final answer.
///
/// The answer may wrap the JSON object in prose or a code fence; the
/// outermost `{...}` span is parsed.
pub fn parse_verdict(messages: &[DriverMessage]) -> Result<SemanticVerdict, DriverError> {
    let text = final_text(messages)
        .ok_or_else(|| DriverError::Permanent("driver returned no final answer".to_string()))?;
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(DriverError::Permanent(format!(
            "driver answer is not a JSON verdict: {}",
            text.trim()
        )));
    };
    if end < start {
        return Err(DriverError::Permanent("malformed JSON verdict".to_string()));
    }
    serde_json::from_str(&text[start..=end])
        .map_err(|err| DriverError::Permanent(format!("parse driver verdict: {err}")))
}

/// Fail when the agent reported an error as its final result.
pub fn ensure_success(messages: &[DriverMessage]) -> Result<(), DriverError> {
    match messages.iter().rev().find_map(|message| match message {
        DriverMessage::FinalResult { result, is_error } => Some((result, *is_error)),
        _ => None,
    }) {
        Some((result, true)) => Err(DriverError::Permanent(result.clone())),
        _ => Ok(()),
    }
}

/// Driver that spawns an agent command per call.
///
/// The prompt is written to stdin; stdout is read as JSON lines, one
/// [`DriverMessage`] per line. Non-JSON lines are kept as `text` messages.
#[derive(Debug, Clone)]
pub struct CliDriver {
    command: Vec<String>,
    limits: RunLimits,
    max_messages: usize,
}

impl CliDriver {
    pub fn new(cfg: &DriverConfig, limits: RunLimits) -> Self {
        Self {
            command: cfg.command.clone(),
            limits,
            max_messages: cfg.max_messages,
        }
    }
}

impl Driver for CliDriver {
    #[instrument(skip_all, fields(purpose = request.purpose.as_str()))]
    fn run(&self, request: &DriverRequest) -> Result<Vec<DriverMessage>, DriverError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| DriverError::Permanent("driver command is empty".to_string()))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting driver");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("CONDUCTOR_PURPOSE", request.purpose.as_str());

        let mut messages = Vec::new();
        let mut dropped = 0usize;
        let outcome = stream_command_lines(
            cmd,
            Some(request.prompt.as_bytes()),
            &self.limits,
            request.cancel.as_ref(),
            |line| {
                if line.trim().is_empty() {
                    return true;
                }
                if messages.len() >= self.max_messages {
                    dropped += 1;
                    return true;
                }
                messages.push(parse_message_line(line));
                true
            },
        )
        .map_err(|err| DriverError::Permanent(format!("{err:#}")))?;

        if dropped > 0 {
            warn!(dropped, max_messages = self.max_messages, "driver messages discarded");
        }
        if outcome.cancelled {
            return Err(DriverError::Cancelled);
        }
        if outcome.timed_out {
            return Err(DriverError::Transient(format!(
                "driver timed out after {}s",
                self.limits.timeout.as_secs()
            )));
        }
        if !outcome.status.success() {
            let stderr = String::from_utf8_lossy(&outcome.stderr).trim().to_string();
            let message = format!("driver exited with {:?}: {stderr}", outcome.status.code());
            return Err(classify_failure(message));
        }
        ensure_success(&messages)?;
        debug!(messages = messages.len(), "driver finished");
        Ok(messages)
    }
}

fn parse_message_line(line: &str) -> DriverMessage {
    serde_json::from_str(line).unwrap_or_else(|_| DriverMessage::Text {
        text: line.to_string(),
    })
}

/// Classify a failed run by its diagnostic text.
fn classify_failure(message: String) -> DriverError {
    const TRANSIENT_MARKERS: [&str; 8] = [
        "timed out",
        "timeout",
        "connection",
        "rate limit",
        "overloaded",
        "temporarily",
        "429",
        "503",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        DriverError::Transient(message)
    } else {
        DriverError::Permanent(message)
    }
}
