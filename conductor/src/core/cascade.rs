//! Transitive skip propagation through the plan's dependency graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::types::SkipRecord;
use crate::plan::Plan;

/// Compute the steps that must be skipped because `cause` failed or was skipped.
///
/// Returns only entries not already present in `existing`, so applying the
/// result and calling again yields an empty map. Every entry cites `cause`.
/// Terminates on any finite graph; cycles are rejected at plan acceptance.
pub fn cascade_skips(
    cause: &str,
    plan: &Plan,
    existing: &BTreeMap<String, SkipRecord>,
) -> BTreeMap<String, SkipRecord> {
    let mut added = BTreeMap::new();
    for id in transitive_dependents(cause, plan) {
        if existing.contains_key(&id) {
            continue;
        }
        added.insert(
            id,
            SkipRecord {
                cause: cause.to_string(),
                reason: format!("skipped: depends on '{cause}' which did not complete"),
            },
        );
    }
    added
}

/// Ids that would be skipped if `cause` does not complete, in plan order.
pub fn preview_cascade(cause: &str, plan: &Plan) -> Vec<String> {
    let dependents = transitive_dependents(cause, plan);
    plan.steps()
        .filter(|step| dependents.contains(&step.id))
        .map(|step| step.id.clone())
        .collect()
}

/// Withdraw skips that `cause` introduced, e.g. before retrying it.
///
/// Returns the ids that were removed, sorted.
pub fn release_skips(cause: &str, skipped: &mut BTreeMap<String, SkipRecord>) -> Vec<String> {
    let released: Vec<String> = skipped
        .iter()
        .filter(|(_, record)| record.cause == cause)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &released {
        skipped.remove(id);
    }
    released
}

fn transitive_dependents(cause: &str, plan: &Plan) -> BTreeSet<String> {
    let mut dependents_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in plan.steps() {
        for dep in &step.depends_on {
            dependents_of
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([cause]);
    while let Some(current) = queue.pop_front() {
        let Some(children) = dependents_of.get(current) else {
            continue;
        };
        for child in children {
            if *child != cause && seen.insert((*child).to_string()) {
                queue.push_back(*child);
            }
        }
    }
    seen
}
