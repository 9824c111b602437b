//! Checkpoint policy between batches.

use crate::core::types::TrustLevel;
use crate::plan::{Batch, RiskLevel};

/// Decide whether to pause for human approval before running `next`.
///
/// Paranoid and standard trust always pause. Autonomous trust only pauses
/// when the upcoming batch's risk summary is high.
pub fn should_checkpoint(next: &Batch, trust: TrustLevel) -> bool {
    match trust {
        TrustLevel::Paranoid | TrustLevel::Standard => true,
        TrustLevel::Autonomous => next.risk_summary() == RiskLevel::High,
    }
}
