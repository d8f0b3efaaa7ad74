use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use dagflow::Operation;

#[derive(Parser)]
#[command(name = "tfwrap")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Graph-ordered Terraform runner for monorepos", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan every directory in dependency order
    Plan(RunArgs),

    /// Apply every directory in dependency order
    Apply(RunArgs),

    /// Destroy every directory in reverse dependency order
    Destroy(RunArgs),

    /// Execute a CSV pipeline of directories in explicit sequence order
    Pipeline(PipelineArgs),

    /// Print the dependency graph of a directory tree
    Graph {
        /// Root directory to scan
        directory: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Terraform operation, as a positional CLI value.
#[derive(Clone, Copy, ValueEnum)]
pub enum OperationArg {
    Plan,
    Apply,
    Destroy,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Plan => Self::Plan,
            OperationArg::Apply => Self::Apply,
            OperationArg::Destroy => Self::Destroy,
        }
    }
}

#[derive(Args)]
pub struct PipelineArgs {
    /// Terraform operation to run for every pipeline entry
    #[arg(value_enum)]
    pub operation: OperationArg,

    /// Pipeline CSV file with seq, directory and variables columns
    pub file: PathBuf,

    /// Number of entries to run in parallel within a sequence
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    /// Turn on Terraform debug logging (TF_LOG=DEBUG)
    #[arg(long)]
    pub debug: bool,

    /// Only print output for directories that had changes
    #[arg(long)]
    pub changes_only: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Additional arguments passed through to every Terraform operation
    #[arg(last = true)]
    pub tf_args: Vec<String>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Root directory to scan for Terraform configurations
    pub directory: PathBuf,

    /// Only execute directories under this prefix; the rest of the graph
    /// is traversed as no-ops
    #[arg(short, long)]
    pub prefix: Option<PathBuf>,

    /// Number of directories to run in parallel
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    /// Turn on Terraform debug logging (TF_LOG=DEBUG)
    #[arg(long)]
    pub debug: bool,

    /// Only print output for directories that had changes
    #[arg(long)]
    pub changes_only: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Endpoint to POST a run summary to (best effort)
    #[arg(long, env = "TFWRAP_AUDIT_API")]
    pub audit_api: Option<String>,

    /// Additional arguments passed through to every Terraform operation
    #[arg(last = true)]
    pub tf_args: Vec<String>,
}
