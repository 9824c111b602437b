//! Batch execution engine for agent-produced implementation plans.
//!
//! A plan arrives as ordered batches of steps. The engine validates each
//! step, executes it with fallbacks, cascades failures to dependents, and
//! pauses for human approval or blocker resolution between batches. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan acceptance, cascade,
//!   state transitions, output checks). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, git, the agent
//!   driver, persisted state and events). Isolated behind traits so tests
//!   can substitute scripted fakes.
//!
//! Orchestration modules ([`validator`], [`fallback`], [`batch`],
//! [`workflow`]) coordinate core logic with I/O.

pub mod batch;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod fallback;
pub mod io;
pub mod logging;
pub mod plan;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validator;
pub mod workflow;
