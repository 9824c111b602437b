//! Prompt rendering for driver calls.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::{BlockerReport, StepResult};
use crate::plan::{Batch, Step};

const STEP_VALIDATION_TEMPLATE: &str = include_str!("prompts/step_validation.md");
const BATCH_REVIEW_TEMPLATE: &str = include_str!("prompts/batch_review.md");
const EDIT_TEMPLATE: &str = include_str!("prompts/edit.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const REVISION_TEMPLATE: &str = include_str!("prompts/revision.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("step_validation", STEP_VALIDATION_TEMPLATE)
            .expect("step_validation template should be valid");
        env.add_template("batch_review", BATCH_REVIEW_TEMPLATE)
            .expect("batch_review template should be valid");
        env.add_template("edit", EDIT_TEMPLATE)
            .expect("edit template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        env.add_template("revision", REVISION_TEMPLATE)
            .expect("revision template should be valid");
        Self { env }
    }

    pub fn render_step_validation(
        &self,
        goal: &str,
        step: &Step,
        completed: &[String],
    ) -> Result<String> {
        let template = self.env.get_template("step_validation")?;
        Ok(template.render(context! {
            goal => goal.trim(),
            step => step,
            completed => completed,
        })?)
    }

    pub fn render_batch_review(&self, goal: &str, batch: &Batch) -> Result<String> {
        let template = self.env.get_template("batch_review")?;
        Ok(template.render(context! {
            goal => goal.trim(),
            batch => batch,
        })?)
    }

    pub fn render_edit(
        &self,
        goal: &str,
        step: &Step,
        file: &str,
        instruction: &str,
    ) -> Result<String> {
        let template = self.env.get_template("edit")?;
        Ok(template.render(context! {
            goal => goal.trim(),
            step => step,
            file => file,
            instruction => instruction.trim(),
        })?)
    }

    pub fn render_fix(
        &self,
        goal: &str,
        step: &Step,
        blocker: &BlockerReport,
        instruction: &str,
    ) -> Result<String> {
        let template = self.env.get_template("fix")?;
        Ok(template.render(context! {
            goal => goal.trim(),
            step => step,
            blocker => blocker,
            instruction => instruction.trim(),
        })?)
    }

    pub fn render_revision(
        &self,
        goal: &str,
        batch: &Batch,
        results: &[StepResult],
        feedback: &str,
    ) -> Result<String> {
        let template = self.env.get_template("revision")?;
        Ok(template.render(context! {
            goal => goal.trim(),
            batch => batch,
            results => results,
            feedback => feedback.trim(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockerKind;
    use crate::plan::RiskLevel;
    use crate::test_support::{batch, code_edit_step, depends_on, shell_step, step_with_risk};

    #[test]
    fn step_validation_prompt_describes_shell_action() {
        let step = step_with_risk(shell_step("migrate", "make migrate"), RiskLevel::High);
        let prompt = PromptEngine::new()
            .render_step_validation("ship it", &step, &["setup".to_string()])
            .expect("render");
        assert!(prompt.contains("Goal: ship it"));
        assert!(prompt.contains("Step `migrate`"));
        assert!(prompt.contains("Risk: high"));
        assert!(prompt.contains("run `make migrate`"));
        assert!(prompt.contains("Already completed steps: setup"));
        assert!(prompt.contains("\"approved\""));
    }

    #[test]
    fn step_validation_prompt_describes_code_edit() {
        let step = code_edit_step("e1", "src/a.py", "x = 1\n");
        let prompt = PromptEngine::new()
            .render_step_validation("goal", &step, &[])
            .expect("render");
        assert!(prompt.contains("Action: write `src/a.py`"));
        assert!(!prompt.contains("Already completed"));
    }

    #[test]
    fn batch_review_lists_steps_with_dependencies() {
        let review = batch(
            2,
            vec![
                shell_step("a", "true"),
                depends_on(shell_step("b", "true"), &["a"]),
            ],
        );
        let prompt = PromptEngine::new()
            .render_batch_review("goal", &review)
            .expect("render");
        let a = prompt.find("- `a`").expect("step a");
        let b = prompt.find("- `b`").expect("step b");
        assert!(a < b);
        assert!(prompt.contains("[after a]"));
    }

    #[test]
    fn fix_prompt_includes_attempts_and_instruction() {
        let step = shell_step("t", "pytest");
        let blocker = BlockerReport {
            step_id: "t".to_string(),
            step_description: "run tests".to_string(),
            kind: BlockerKind::ExecutionFailure,
            message: "exit code 1 (expected 0)".to_string(),
            attempted: vec!["pytest".to_string(), "python -m pytest".to_string()],
            suggestions: Vec::new(),
            cascade_preview: Vec::new(),
        };
        let prompt = PromptEngine::new()
            .render_fix("goal", &step, &blocker, "install pytest first")
            .expect("render");
        assert!(prompt.contains("Failure (execution_failure)"));
        assert!(prompt.contains("- `python -m pytest`"));
        assert!(prompt.contains("install pytest first"));
    }
}
