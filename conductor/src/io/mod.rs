//! I/O adapters: processes, git, the agent driver, and persisted state.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod edit;
pub mod events;
pub mod git;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod state_store;
