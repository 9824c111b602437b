//! Test-only builders and scripted fakes for plans, drivers, sinks and repos.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;

use crate::io::driver::{Driver, DriverError, DriverMessage, DriverPurpose, DriverRequest};
use crate::io::events::{EngineEvent, EventSink};
use crate::io::git::Git;
use crate::plan::{
    Batch, ExecutionHints, FileChange, Plan, RiskLevel, Step, StepAction, StepValidation,
    TddMarker,
};

/// Low-risk shell step with no fallbacks or dependencies.
pub fn shell_step(id: &str, command: &str) -> Step {
    Step {
        id: id.to_string(),
        description: format!("{id} step"),
        action: StepAction::Shell {
            command: command.to_string(),
            workdir: None,
            fallbacks: Vec::new(),
        },
        validation: StepValidation::default(),
        hints: ExecutionHints::default(),
        depends_on: Vec::new(),
        tdd: TddMarker::default(),
    }
}

/// Code-edit step that writes `contents` to `file`.
pub fn code_edit_step(id: &str, file: &str, contents: &str) -> Step {
    Step {
        action: StepAction::CodeEdit {
            file: PathBuf::from(file),
            change: FileChange::Write {
                contents: contents.to_string(),
            },
        },
        ..shell_step(id, "")
    }
}

/// Code-edit step that replaces `find` with `replace` in `file`.
pub fn replace_step(id: &str, file: &str, find: &str, replace: &str) -> Step {
    Step {
        action: StepAction::CodeEdit {
            file: PathBuf::from(file),
            change: FileChange::Replace {
                find: find.to_string(),
                replace: replace.to_string(),
            },
        },
        ..shell_step(id, "")
    }
}

pub fn step_with_risk(mut step: Step, risk: RiskLevel) -> Step {
    step.hints.risk = risk;
    step
}

pub fn depends_on(mut step: Step, ids: &[&str]) -> Step {
    step.depends_on = ids.iter().map(|id| id.to_string()).collect();
    step
}

/// Batch whose declared risk matches its steps.
pub fn batch(number: u32, steps: Vec<Step>) -> Batch {
    let mut batch = Batch {
        number,
        risk: RiskLevel::Low,
        description: format!("batch {number}"),
        steps,
    };
    batch.risk = batch.risk_summary();
    batch
}

pub fn plan(batches: Vec<Batch>) -> Plan {
    Plan {
        goal: "test goal".to_string(),
        batches,
        estimated_secs: 0,
        tdd: false,
    }
}

pub fn final_result(text: &str) -> Vec<DriverMessage> {
    vec![DriverMessage::FinalResult {
        result: text.to_string(),
        is_error: false,
    }]
}

/// Driver answer for a semantic check.
pub fn verdict(approved: bool, issue: Option<&str>) -> Vec<DriverMessage> {
    let body = serde_json::json!({
        "approved": approved,
        "issue": issue,
        "suggestions": [],
    });
    final_result(&body.to_string())
}

type Reply = Result<Vec<DriverMessage>, DriverError>;
type Effect = Arc<dyn Fn(&DriverRequest) + Send + Sync>;

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    fallback: Option<Vec<DriverMessage>>,
    effect: Option<Effect>,
    requests: Vec<DriverRequest>,
}

/// Driver that replays scripted replies in order and records each request.
///
/// Clones share the script, so a test can keep one handle and give the
/// engine another.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                replies: replies.into(),
                ..Script::default()
            })),
        }
    }

    /// Driver that approves every semantic check once its script runs out.
    pub fn approving() -> Self {
        let driver = Self::new(Vec::new());
        driver.lock().fallback = Some(verdict(true, None));
        driver
    }

    /// Run `effect` on every call before replying, e.g. to edit the worktree.
    pub fn with_effect(self, effect: impl Fn(&DriverRequest) + Send + Sync + 'static) -> Self {
        self.lock().effect = Some(Arc::new(effect));
        self
    }

    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<DriverRequest> {
        self.lock().requests.clone()
    }

    pub fn purposes(&self) -> Vec<DriverPurpose> {
        self.lock()
            .requests
            .iter()
            .map(|request| request.purpose)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("scripted driver lock")
    }
}

impl Driver for ScriptedDriver {
    fn run(&self, request: &DriverRequest) -> Result<Vec<DriverMessage>, DriverError> {
        let (effect, reply) = {
            let mut script = self.lock();
            script.requests.push(request.clone());
            let reply = match script.replies.pop_front() {
                Some(reply) => reply,
                None => script.fallback.clone().ok_or_else(|| {
                    DriverError::Permanent(format!(
                        "scripted driver has no reply for {} call",
                        request.purpose.as_str()
                    ))
                }),
            };
            (script.effect.clone(), reply)
        };
        if let Some(effect) = effect {
            effect(request);
        }
        reply
    }
}

/// Sink that keeps every event in memory. Clones share the buffer.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(String, EngineEvent)>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, EngineEvent)> {
        self.events.lock().expect("recording sink lock").clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|(_, event)| event.name().to_string())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, workflow_id: &str, event: &EngineEvent) -> Result<()> {
        self.events
            .lock()
            .expect("recording sink lock")
            .push((workflow_id.to_string(), event.clone()));
        Ok(())
    }
}

/// Throwaway git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["-c", "init.defaultBranch=main", "init", "--quiet"]);
        repo.git(&["config", "user.email", "tests@example.com"]);
        repo.git(&["config", "user.name", "Tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        for (path, contents) in files {
            repo.write(path, contents);
        }
        let git = Git::new(repo.path());
        git.add_all().expect("git add");
        git.commit("initial").expect("git commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.dir.path().join(relative)).expect("read file")
    }

    fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }
}
