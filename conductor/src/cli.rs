//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::debug;

use conductor::core::acceptance::accept_plan;
use conductor::core::machine::pending_approval_batch;
use conductor::core::types::{Resolution, TrustLevel, WorkflowState, WorkflowStatus};
use conductor::exit_codes;
use conductor::io::config::load_config;
use conductor::io::driver::CliDriver;
use conductor::io::events::JsonlEventLog;
use conductor::io::state_store::{config_path, list_workflows, load_state};
use conductor::plan::load_plan;
use conductor::workflow::{Engine, StartOptions};

pub struct Paths {
    pub workdir: PathBuf,
    pub state_root: PathBuf,
}

fn engine(paths: &Paths) -> Result<Engine> {
    let config = load_config(&config_path(&paths.state_root))?;
    debug!(trust_level = %config.trust_level, "loaded config");
    let driver = CliDriver::new(&config.driver, config.driver_limits());
    let sink = JsonlEventLog::new(&paths.state_root);
    Ok(Engine::new(
        &paths.workdir,
        &paths.state_root,
        config,
        Arc::new(driver),
        Arc::new(sink),
    ))
}

/// Validate a plan file and print the batches it would run as.
pub fn check_plan(plan_path: &Path) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    let accepted = accept_plan(&plan)
        .map_err(|errors| anyhow!("plan rejected:\n- {}", errors.join("\n- ")))?;
    println!(
        "plan: batches={} steps={}",
        accepted.batches.len(),
        accepted.step_count()
    );
    if accepted.batches.len() != plan.batches.len() {
        println!(
            "plan: regrouped {} batch(es) into {}",
            plan.batches.len(),
            accepted.batches.len()
        );
    }
    for batch in &accepted.batches {
        println!(
            "batch {}: risk={} steps={}",
            batch.number,
            batch.risk_summary(),
            batch.step_ids().join(",")
        );
    }
    Ok(exit_codes::OK)
}

pub fn run_plan(
    paths: &Paths,
    plan_path: &Path,
    id: Option<String>,
    trust_level: Option<TrustLevel>,
) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    let state = engine(paths)?.start(
        plan,
        StartOptions {
            workflow_id: id,
            trust_level,
        },
    )?;
    Ok(report(&state))
}

pub fn resume(paths: &Paths, id: &str) -> Result<i32> {
    let state = engine(paths)?.resume(id)?;
    Ok(report(&state))
}

pub fn approve(paths: &Paths, id: &str, approved: bool, feedback: Option<String>) -> Result<i32> {
    let state = engine(paths)?.submit_approval(id, approved, feedback)?;
    Ok(report(&state))
}

pub fn resolve(paths: &Paths, id: &str, resolution: Resolution) -> Result<i32> {
    let state = engine(paths)?.resolve_blocker(id, resolution)?;
    Ok(report(&state))
}

pub fn cancel(paths: &Paths, id: &str) -> Result<i32> {
    engine(paths)?.cancel(id)?;
    println!("cancel: requested for {id}");
    Ok(exit_codes::OK)
}

pub fn status(paths: &Paths, id: Option<&str>, json: bool) -> Result<i32> {
    let Some(id) = id else {
        for id in list_workflows(&paths.state_root)? {
            let state = load_state(&paths.state_root, &id)?;
            println!("{} {}", id, state.status.as_str());
        }
        return Ok(exit_codes::OK);
    };
    let state = load_state(&paths.state_root, id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(exit_codes::for_status(state.status));
    }
    Ok(report(&state))
}

pub fn changes(paths: &Paths, id: &str) -> Result<i32> {
    for path in engine(paths)?.changed_files(id)? {
        println!("{path}");
    }
    Ok(exit_codes::OK)
}

/// Print a workflow summary and return the matching exit code.
fn report(state: &WorkflowState) -> i32 {
    println!(
        "workflow: id={} status={} trust={} batch={}/{}",
        state.workflow_id,
        state.status.as_str(),
        state.trust_level,
        state.cursor.batch.min(state.plan.batches.len()),
        state.plan.batches.len()
    );
    match state.status {
        WorkflowStatus::BatchComplete => {
            if let Some(batch) = pending_approval_batch(state) {
                println!("approval: batch {batch} complete; approve or reject to continue");
            }
            if let Some(feedback) = &state.feedback {
                println!("approval: revision pending for feedback: {feedback}");
            }
        }
        WorkflowStatus::Blocked => {
            if let Some(blocker) = &state.blocker {
                println!(
                    "blocker: step={} kind={}",
                    blocker.step_id,
                    blocker.kind.as_str()
                );
                println!("blocker: {}", blocker.message);
                for attempt in &blocker.attempted {
                    println!("attempted: {attempt}");
                }
                for suggestion in &blocker.suggestions {
                    println!("suggestion: {suggestion}");
                }
            }
        }
        status if status.is_terminal() => {
            let skipped = state.skipped.len();
            if skipped > 0 {
                println!("skipped: {skipped} step(s)");
            }
        }
        _ => {}
    }
    exit_codes::for_status(state.status)
}
