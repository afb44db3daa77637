use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hammer")]
#[command(author = "HAMMER maintainers")]
#[command(version)]
#[command(about = "Grade infrastructure-automation labs in baseline, mutation and idempotence phases", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Grader config file (default: ~/.config/hammer/config.toml)
    #[arg(long, global = true, env = "HAMMER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a lab spec and report every problem found
    Validate(SpecArgs),

    /// Resolve variables and print the execution plan without touching machines
    Plan(PlanArgs),

    /// Grade a submission against a lab spec
    Grade(GradeArgs),

    /// Check that the tools grading needs are installed
    Doctor,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct SpecArgs {
    /// Path to the lab spec (YAML)
    pub spec: PathBuf,
}

/// How a node's groups are ordered when several set the same variable
#[derive(Clone, Copy, ValueEnum)]
pub enum GroupOrder {
    /// The node's own group order; the last group wins
    LastDeclared,
    /// Lexicographic group order (legacy labs)
    Alphabetical,
}

impl From<GroupOrder> for grading::GroupPrecedence {
    fn from(order: GroupOrder) -> Self {
        match order {
            GroupOrder::LastDeclared => Self::LastDeclared,
            GroupOrder::Alphabetical => Self::Alphabetical,
        }
    }
}

#[derive(Args)]
pub struct PlanArgs {
    /// Path to the lab spec (YAML)
    pub spec: PathBuf,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Override the configured group precedence
    #[arg(long, value_enum)]
    pub group_order: Option<GroupOrder>,
}

#[derive(Args)]
pub struct GradeArgs {
    /// Path to the lab spec (YAML)
    pub spec: PathBuf,

    /// Student submission directory
    pub submission: PathBuf,

    /// Results directory for report.json, summary.txt and logs
    #[arg(short, long, default_value = "results", env = "HAMMER_RESULTS_DIR")]
    pub output: PathBuf,

    /// Converge timeout in seconds
    #[arg(long, env = "HAMMER_CONVERGE_TIMEOUT")]
    pub converge_timeout: Option<u64>,

    /// Hosts verified in parallel
    #[arg(short, long, env = "HAMMER_JOBS")]
    pub jobs: Option<usize>,

    /// Override the configured group precedence
    #[arg(long, value_enum)]
    pub group_order: Option<GroupOrder>,

    /// Do not ask before converging and rebooting the lab machines
    #[arg(short, long)]
    pub yes: bool,
}
