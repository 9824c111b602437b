//! Implementation plan model consumed by the engine.
//!
//! Plans are produced by an external planner and arrive as JSON. Once
//! accepted (see [`crate::core::acceptance`]) a plan is never mutated;
//! re-planning produces a new `Plan` value.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");

/// Declared risk of a step; controls validation tier and batch isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Maximum number of steps a batch with this risk summary may hold.
    pub fn batch_limit(self) -> usize {
        match self {
            RiskLevel::Low => 5,
            RiskLevel::Medium => 3,
            RiskLevel::High => 1,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub action: StepAction,
    #[serde(default)]
    pub validation: StepValidation,
    #[serde(default)]
    pub hints: ExecutionHints,
    /// Ids of steps that must complete before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tdd: TddMarker,
}

impl Step {
    pub fn risk(&self) -> RiskLevel {
        self.hints.risk
    }

    /// Short human label for the step's primary action.
    pub fn action_label(&self) -> String {
        match &self.action {
            StepAction::CodeEdit { file, change } => {
                format!("{} {}", change.mode(), file.display())
            }
            StepAction::Shell { command, .. } => command.clone(),
        }
    }
}

/// What a step does. Exactly one payload is present per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    CodeEdit {
        /// Target path, relative to the workflow's working tree.
        file: PathBuf,
        change: FileChange,
    },
    Shell {
        command: String,
        /// Working directory, relative to the workflow's working tree.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<PathBuf>,
        /// Alternate commands tried in order when the primary fails.
        #[serde(default)]
        fallbacks: Vec<String>,
    },
}

/// The change a code-edit step applies to its target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FileChange {
    /// Create or overwrite the file with `contents`.
    Write { contents: String },
    /// Replace every occurrence of `find` with `replace`.
    Replace { find: String, replace: String },
    /// Hand a natural-language edit instruction to the driver.
    Instruct { instruction: String },
}

impl FileChange {
    pub fn mode(&self) -> &'static str {
        match self {
            FileChange::Write { .. } => "write",
            FileChange::Replace { .. } => "replace",
            FileChange::Instruct { .. } => "instruct",
        }
    }
}

/// How the engine decides whether a step succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepValidation {
    pub expected_exit_code: i32,
    /// Regex matched against ANSI-stripped stdout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_pattern: Option<String>,
    /// Separate command run after the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub success_criteria: String,
}

impl Default for StepValidation {
    fn default() -> Self {
        Self {
            expected_exit_code: 0,
            output_pattern: None,
            command: None,
            success_criteria: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionHints {
    pub risk: RiskLevel,
    pub estimated_secs: u64,
    pub requires_human_judgment: bool,
}

impl Default for ExecutionHints {
    fn default() -> Self {
        Self {
            risk: RiskLevel::Low,
            estimated_secs: 0,
            requires_human_judgment: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TddMarker {
    pub is_test: bool,
    /// Id of the step this test step validates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validates: Option<String>,
}

/// An ordered group of steps executed as one checkpointed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub number: u32,
    pub risk: RiskLevel,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

impl Batch {
    /// Highest risk among the batch's steps.
    pub fn risk_summary(&self) -> RiskLevel {
        self.steps
            .iter()
            .map(Step::risk)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.id.clone()).collect()
    }
}

/// An accepted implementation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub batches: Vec<Batch>,
    #[serde(default)]
    pub estimated_secs: u64,
    #[serde(default)]
    pub tdd: bool,
}

impl Plan {
    /// All steps in plan order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.batches.iter().flat_map(|batch| batch.steps.iter())
    }

    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.steps().find(|step| step.id == id)
    }

    pub fn step_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.steps.len()).sum()
    }
}

/// Parse a plan document: schema conformance first, then the typed model.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let instance: Value = serde_json::from_str(raw).context("parse plan json")?;
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("plan schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("parse plan as typed model")
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_plan(&raw).with_context(|| format!("load plan {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{shell_step, step_with_risk};

    #[test]
    fn step_action_is_tagged_by_kind() {
        let raw = r#"{
            "id": "s1",
            "description": "run tests",
            "action": { "kind": "shell", "command": "cargo test", "fallbacks": ["cargo test -- --nocapture"] }
        }"#;
        let step: Step = serde_json::from_str(raw).expect("parse");
        match &step.action {
            StepAction::Shell {
                command,
                workdir,
                fallbacks,
            } => {
                assert_eq!(command, "cargo test");
                assert!(workdir.is_none());
                assert_eq!(fallbacks.len(), 1);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(step.validation.expected_exit_code, 0);
        assert_eq!(step.risk(), RiskLevel::Low);
    }

    #[test]
    fn code_edit_rejects_unknown_change_mode() {
        let raw = r#"{
            "id": "s1",
            "description": "edit",
            "action": { "kind": "code_edit", "file": "a.py", "change": { "mode": "bogus" } }
        }"#;
        assert!(serde_json::from_str::<Step>(raw).is_err());
    }

    #[test]
    fn risk_summary_is_max_step_risk() {
        let batch = Batch {
            number: 1,
            risk: RiskLevel::Low,
            description: String::new(),
            steps: vec![
                shell_step("a", "true"),
                step_with_risk(shell_step("b", "true"), RiskLevel::Medium),
            ],
        };
        assert_eq!(batch.risk_summary(), RiskLevel::Medium);
    }

    #[test]
    fn parse_plan_accepts_minimal_document() {
        let raw = r#"{
            "goal": "add a greeting",
            "batches": [{
                "number": 1,
                "risk": "low",
                "steps": [{
                    "id": "write",
                    "description": "write hello.py",
                    "action": {
                        "kind": "code_edit",
                        "file": "hello.py",
                        "change": { "mode": "write", "contents": "print('hi')\n" }
                    }
                }]
            }]
        }"#;
        let plan = parse_plan(raw).expect("parse");
        assert_eq!(plan.step_count(), 1);
        assert_eq!(plan.batches[0].steps[0].action_label(), "write hello.py");
    }

    #[test]
    fn parse_plan_reports_schema_violations() {
        let raw = r#"{
            "goal": "x",
            "batches": [{
                "number": 1,
                "risk": "extreme",
                "steps": [{ "id": "a", "description": "a", "action": { "kind": "shell" } }]
            }]
        }"#;
        let err = parse_plan(raw).expect_err("invalid");
        let message = format!("{err:#}");
        assert!(message.contains("schema validation failed"));
        assert!(message.contains("extreme"));
    }

    #[test]
    fn risk_levels_order_low_to_high() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert_eq!(RiskLevel::High.batch_limit(), 1);
    }
}
