//! Plan acceptance: dependency validation and batch size enforcement.
//!
//! A plan from the planner is accepted as-is when it already satisfies the
//! engine's invariants. Oversized or mis-ordered batches are split and
//! regrouped; only structurally broken plans (unknown ids, cycles) are
//! rejected.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::plan::{Batch, Plan, RiskLevel, Step};

/// Validate and normalize a plan for execution.
///
/// Returns the accepted plan or a sorted list of errors.
pub fn accept_plan(plan: &Plan) -> Result<Plan, Vec<String>> {
    let errors = validate_dependencies(plan);
    if !errors.is_empty() {
        return Err(errors);
    }
    let order = topological_order(plan)?;

    let groups = if has_forward_references(plan) {
        regroup_in_order(plan, &order)
    } else {
        plan.batches
            .iter()
            .map(|batch| (batch.description.clone(), batch.steps.clone()))
            .collect()
    };

    let mut batches = Vec::new();
    for (description, steps) in groups {
        let parts = split_by_risk(steps);
        let total = parts.len();
        for (idx, part) in parts.into_iter().enumerate() {
            let description = if total > 1 {
                format!("{} (part {}/{})", description, idx + 1, total)
            } else {
                description.clone()
            };
            batches.push(make_batch(0, description, part));
        }
    }
    for (idx, batch) in batches.iter_mut().enumerate() {
        batch.number = idx as u32 + 1;
    }

    Ok(Plan {
        goal: plan.goal.clone(),
        batches,
        estimated_secs: plan.estimated_secs,
        tdd: plan.tdd,
    })
}

/// Report batches that violate the size invariant:
/// low-only ≤ 5 steps, any medium ≤ 3, any high step alone.
pub fn batch_size_violations(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    for batch in &plan.batches {
        let summary = batch.risk_summary();
        let limit = summary.batch_limit();
        if batch.steps.is_empty() {
            errors.push(format!("batch {}: has no steps", batch.number));
        } else if batch.steps.len() > limit {
            errors.push(format!(
                "batch {}: {} steps exceeds the {} limit of {}",
                batch.number,
                batch.steps.len(),
                summary,
                limit
            ));
        }
        if batch.risk != summary {
            errors.push(format!(
                "batch {}: declared risk {} but steps summarize to {}",
                batch.number, batch.risk, summary
            ));
        }
    }
    errors
}

fn validate_dependencies(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.step_count() == 0 {
        errors.push("plan has no steps".to_string());
        return errors;
    }

    let mut seen = HashSet::new();
    for step in plan.steps() {
        if step.id.trim().is_empty() {
            errors.push("step with empty id".to_string());
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in plan.steps() {
        for dep in &step.depends_on {
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("step '{}' depends on unknown step '{}'", step.id, dep));
            }
        }
        if let Some(target) = &step.tdd.validates
            && !seen.contains(target.as_str())
        {
            errors.push(format!(
                "test step '{}' validates unknown step '{}'",
                step.id, target
            ));
        }
    }

    errors.sort();
    errors.dedup();
    errors
}

/// Stable topological order of step positions (Kahn, earliest position first).
fn topological_order(plan: &Plan) -> Result<Vec<usize>, Vec<String>> {
    let steps: Vec<&Step> = plan.steps().collect();
    let position: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(idx, step)| (step.id.as_str(), idx))
        .collect();

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (idx, step) in steps.iter().enumerate() {
        let deps: BTreeSet<usize> = step
            .depends_on
            .iter()
            .filter_map(|dep| position.get(dep.as_str()).copied())
            .collect();
        indegree[idx] = deps.len();
        for dep in deps {
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|idx| indegree[*idx] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in &dependents[next] {
            indegree[*dependent] -= 1;
            if indegree[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let mut stuck: Vec<&str> = (0..steps.len())
            .filter(|idx| indegree[*idx] > 0)
            .map(|idx| steps[idx].id.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(vec![format!(
            "dependency cycle among steps: {}",
            stuck.join(", ")
        )]);
    }
    Ok(order)
}

fn has_forward_references(plan: &Plan) -> bool {
    let mut earlier = HashSet::new();
    for step in plan.steps() {
        if step
            .depends_on
            .iter()
            .any(|dep| !earlier.contains(dep.as_str()))
        {
            return true;
        }
        earlier.insert(step.id.as_str());
    }
    false
}

/// Rebuild groups from a reordered step list, keeping runs of steps that
/// came from the same original batch together.
fn regroup_in_order(plan: &Plan, order: &[usize]) -> Vec<(String, Vec<Step>)> {
    let mut origin = Vec::new();
    for (batch_idx, batch) in plan.batches.iter().enumerate() {
        for step in &batch.steps {
            origin.push((batch_idx, step));
        }
    }

    let mut groups: Vec<(usize, String, Vec<Step>)> = Vec::new();
    for idx in order {
        let (batch_idx, step) = origin[*idx];
        match groups.last_mut() {
            Some((last_batch, _, steps)) if *last_batch == batch_idx => steps.push(step.clone()),
            _ => groups.push((
                batch_idx,
                plan.batches[batch_idx].description.clone(),
                vec![step.clone()],
            )),
        }
    }
    groups
        .into_iter()
        .map(|(_, description, steps)| (description, steps))
        .collect()
}

/// Greedily split consecutive steps so each part satisfies the size limit.
fn split_by_risk(steps: Vec<Step>) -> Vec<Vec<Step>> {
    let mut parts = Vec::new();
    let mut current: Vec<Step> = Vec::new();
    let mut current_risk = RiskLevel::Low;

    for step in steps {
        if step.risk() == RiskLevel::High {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.push(vec![step]);
            current_risk = RiskLevel::Low;
            continue;
        }
        let combined = current_risk.max(step.risk());
        if current.len() + 1 > combined.batch_limit() {
            parts.push(std::mem::take(&mut current));
            current_risk = step.risk();
        } else {
            current_risk = combined;
        }
        current.push(step);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn make_batch(number: u32, description: String, steps: Vec<Step>) -> Batch {
    let mut batch = Batch {
        number,
        risk: RiskLevel::Low,
        description,
        steps,
    };
    batch.risk = batch.risk_summary();
    batch
}
