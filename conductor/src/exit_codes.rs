//! Stable exit codes for conductor CLI commands.

use crate::core::types::WorkflowStatus;

/// Command succeeded, or the workflow finished every batch.
pub const OK: i32 = 0;
/// Invalid plan, config, workflow id, or any other error.
pub const INVALID: i32 = 1;
/// The workflow paused after a batch and awaits approval.
pub const AWAITING_APPROVAL: i32 = 2;
/// A step blocked and the workflow awaits a resolution.
pub const BLOCKED: i32 = 3;
/// The workflow was aborted.
pub const ABORTED: i32 = 4;

/// Exit code reported after a command leaves a workflow in `status`.
pub fn for_status(status: WorkflowStatus) -> i32 {
    match status {
        WorkflowStatus::Executing | WorkflowStatus::AllDone => OK,
        WorkflowStatus::BatchComplete => AWAITING_APPROVAL,
        WorkflowStatus::Blocked => BLOCKED,
        WorkflowStatus::Aborted => ABORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_states_have_distinct_codes() {
        assert_eq!(for_status(WorkflowStatus::AllDone), OK);
        assert_eq!(for_status(WorkflowStatus::BatchComplete), AWAITING_APPROVAL);
        assert_eq!(for_status(WorkflowStatus::Blocked), BLOCKED);
        assert_eq!(for_status(WorkflowStatus::Aborted), ABORTED);
    }
}
