//! Batch execution engine CLI.
//!
//! Runs an implementation plan against the current git working tree,
//! pausing for approvals and blocker resolutions. Workflow state lives in
//! `.conductor/` so each command can pick up where the last one stopped.

mod cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use conductor::core::types::{Resolution, TrustLevel};
use conductor::exit_codes;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Batch execution engine for agent implementation plans"
)]
struct Cli {
    /// Working tree the plan runs against.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    /// Directory for workflow state; defaults to `<workdir>/.conductor`.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a plan against the schema and the batch invariants.
    CheckPlan { plan: PathBuf },
    /// Start a workflow for a plan and run until the first pause.
    Run {
        plan: PathBuf,
        /// Workflow id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
        /// Overrides the configured trust level.
        #[arg(long, value_enum)]
        trust: Option<TrustArg>,
    },
    /// Continue a workflow that was interrupted mid-batch.
    Resume { id: String },
    /// Approve (or reject) the batch a workflow paused after.
    Approve {
        id: String,
        #[arg(long)]
        reject: bool,
        /// Revision instructions sent to the driver on rejection.
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Resolve the blocker of a blocked workflow.
    Resolve {
        id: String,
        #[arg(value_enum)]
        action: ResolveAction,
        /// Instruction for the driver; required by `fix`.
        #[arg(long)]
        instruction: Option<String>,
    },
    /// Cancel the step a workflow is currently running.
    Cancel { id: String },
    /// Show one workflow, or list all of them.
    Status {
        id: Option<String>,
        /// Print the full persisted state as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List files the in-flight batch has changed.
    Changes { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TrustArg {
    Paranoid,
    Standard,
    Autonomous,
}

impl From<TrustArg> for TrustLevel {
    fn from(value: TrustArg) -> Self {
        match value {
            TrustArg::Paranoid => TrustLevel::Paranoid,
            TrustArg::Standard => TrustLevel::Standard,
            TrustArg::Autonomous => TrustLevel::Autonomous,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResolveAction {
    Retry,
    Skip,
    Fix,
    AbortKeep,
    AbortRevert,
}

impl ResolveAction {
    fn into_resolution(self, instruction: Option<String>) -> anyhow::Result<Resolution> {
        Ok(match self {
            ResolveAction::Retry => Resolution::Retry,
            ResolveAction::Skip => Resolution::Skip,
            ResolveAction::Fix => Resolution::Fix {
                instruction: instruction
                    .filter(|text| !text.trim().is_empty())
                    .ok_or_else(|| anyhow::anyhow!("`resolve fix` needs --instruction"))?,
            },
            ResolveAction::AbortKeep => Resolution::AbortKeep,
            ResolveAction::AbortRevert => Resolution::AbortRevert,
        })
    }
}

fn main() {
    conductor::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let state_root = cli
        .state_dir
        .unwrap_or_else(|| cli.workdir.join(".conductor"));
    let paths = cli::Paths {
        workdir: cli.workdir,
        state_root,
    };
    match cli.command {
        Command::CheckPlan { plan } => cli::check_plan(&plan),
        Command::Run { plan, id, trust } => {
            cli::run_plan(&paths, &plan, id, trust.map(TrustLevel::from))
        }
        Command::Resume { id } => cli::resume(&paths, &id),
        Command::Approve {
            id,
            reject,
            feedback,
        } => cli::approve(&paths, &id, !reject, feedback),
        Command::Resolve {
            id,
            action,
            instruction,
        } => cli::resolve(&paths, &id, action.into_resolution(instruction)?),
        Command::Cancel { id } => cli::cancel(&paths, &id),
        Command::Status { id, json } => cli::status(&paths, id.as_deref(), json),
        Command::Changes { id } => cli::changes(&paths, &id),
    }
}
