//! Engine events for observers.
//!
//! Every emitted event is appended to the workflow's `events.jsonl` and
//! mirrored to `tracing`. Observers that need live updates plug in their
//! own [`EventSink`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{BatchStatus, BlockerReport};
use crate::io::state_store::WorkflowPaths;
use crate::plan::RiskLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    BatchStarted {
        batch: u32,
        risk: RiskLevel,
        steps: Vec<String>,
    },
    BatchCompleted {
        batch: u32,
        status: BatchStatus,
    },
    StepStarted {
        batch: u32,
        step_id: String,
    },
    StepCompleted {
        step_id: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        /// Truncated output of the passing attempt.
        #[serde(default)]
        output: String,
    },
    StepFailed {
        step_id: String,
        message: String,
        attempted: Vec<String>,
        /// Truncated output of the last attempt.
        #[serde(default)]
        output: String,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    StepCancelled {
        step_id: String,
    },
    ApprovalRequired {
        /// Batch that just completed.
        batch: u32,
        next_batch: u32,
        /// Risk summary of the batch waiting to run.
        risk: RiskLevel,
    },
    ApprovalGranted {
        batch: u32,
    },
    ApprovalRejected {
        batch: u32,
        feedback: String,
    },
    BlockerRaised {
        report: BlockerReport,
    },
    BlockerResolved {
        step_id: String,
        resolution: String,
    },
    WorkflowCompleted {
        batches: usize,
    },
    WorkflowAborted {
        reverted: bool,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::BatchStarted { .. } => "batch_started",
            EngineEvent::BatchCompleted { .. } => "batch_completed",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::StepSkipped { .. } => "step_skipped",
            EngineEvent::StepCancelled { .. } => "step_cancelled",
            EngineEvent::ApprovalRequired { .. } => "approval_required",
            EngineEvent::ApprovalGranted { .. } => "approval_granted",
            EngineEvent::ApprovalRejected { .. } => "approval_rejected",
            EngineEvent::BlockerRaised { .. } => "blocker_raised",
            EngineEvent::BlockerResolved { .. } => "blocker_resolved",
            EngineEvent::WorkflowCompleted { .. } => "workflow_completed",
            EngineEvent::WorkflowAborted { .. } => "workflow_aborted",
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub workflow_id: String,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Receiver for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, workflow_id: &str, event: &EngineEvent) -> Result<()>;
}

/// Appends events to `<state_root>/workflows/<id>/events.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    state_root: PathBuf,
}

impl JsonlEventLog {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }
}

impl EventSink for JsonlEventLog {
    fn emit(&self, workflow_id: &str, event: &EngineEvent) -> Result<()> {
        info!(workflow_id, event = event.name(), "engine event");
        let record = EventRecord {
            at: Utc::now(),
            workflow_id: workflow_id.to_string(),
            event: event.clone(),
        };
        let path = WorkflowPaths::new(&self.state_root, workflow_id).events;
        append_json_line(&path, &record)
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, workflow_id: &str, event: &EngineEvent) -> Result<()> {
        for sink in &self.sinks {
            sink.emit(workflow_id, event)?;
        }
        Ok(())
    }
}

/// Read every record of a workflow's event log, oldest first.
pub fn read_events(state_root: &Path, workflow_id: &str) -> Result<Vec<EventRecord>> {
    let path = WorkflowPaths::new(state_root, workflow_id).events;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize event")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    #[test]
    fn events_serialize_with_flat_tag() {
        let record = EventRecord {
            at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .expect("timestamp")
                .with_timezone(&Utc),
            workflow_id: "wf-1".to_string(),
            event: EngineEvent::StepSkipped {
                step_id: "b".to_string(),
                reason: "skipped by user".to_string(),
            },
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "at": "2026-01-02T03:04:05Z",
                "workflow_id": "wf-1",
                "event": "step_skipped",
                "step_id": "b",
                "reason": "skipped by user",
            })
        );
    }

    #[test]
    fn approval_and_blocker_events_carry_their_payloads() {
        let approval = serde_json::to_value(EngineEvent::ApprovalRequired {
            batch: 1,
            next_batch: 2,
            risk: RiskLevel::High,
        })
        .expect("serialize");
        assert_eq!(
            approval,
            serde_json::json!({
                "event": "approval_required",
                "batch": 1,
                "next_batch": 2,
                "risk": "high",
            })
        );

        let report = BlockerReport {
            step_id: "a".to_string(),
            step_description: "run a".to_string(),
            kind: crate::core::types::BlockerKind::ExecutionFailure,
            message: "exit status 1".to_string(),
            attempted: vec!["python run.py".to_string(), "python3 run.py".to_string()],
            suggestions: vec!["install python".to_string()],
            cascade_preview: vec!["b".to_string()],
        };
        let blocker = serde_json::to_value(EngineEvent::BlockerRaised { report })
        .expect("serialize");
        assert_eq!(blocker["event"], "blocker_raised");
        assert_eq!(blocker["report"]["kind"], "execution_failure");
        assert_eq!(
            blocker["report"]["attempted"],
            serde_json::json!(["python run.py", "python3 run.py"])
        );
        assert_eq!(blocker["report"]["cascade_preview"], serde_json::json!(["b"]));
    }

    #[test]
    fn jsonl_log_appends_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(temp.path());
        log.emit(
            "wf-1",
            &EngineEvent::StepStarted {
                batch: 1,
                step_id: "a".to_string(),
            },
        )
        .expect("emit");
        log.emit("wf-1", &EngineEvent::WorkflowCompleted { batches: 1 })
            .expect("emit");

        let records = read_events(temp.path(), "wf-1").expect("read");
        let names: Vec<&str> = records.iter().map(|r| r.event.name()).collect();
        assert_eq!(names, vec!["step_started", "workflow_completed"]);
        assert!(records.iter().all(|r| r.workflow_id == "wf-1"));
    }

    #[test]
    fn fanout_forwards_to_every_sink() {
        let first = RecordingSink::default();
        let second = RecordingSink::default();
        let fanout = FanoutSink::new().with(first.clone()).with(second.clone());
        fanout
            .emit("wf-1", &EngineEvent::ApprovalGranted { batch: 1 })
            .expect("emit");
        assert_eq!(first.names(), vec!["approval_granted"]);
        assert_eq!(second.names(), vec!["approval_granted"]);
    }
}
