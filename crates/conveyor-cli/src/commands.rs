//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter pipeline file
    Init {
        /// Path of the file to create
        #[arg(default_value = "conveyor.yaml")]
        path: PathBuf,
    },

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file (searched for when omitted)
        path: Option<PathBuf>,
    },

    /// Show the jobs a trigger would run, without running them
    Plan {
        /// Path to pipeline file (searched for when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Event kind to plan for
        #[arg(long, value_enum, default_value_t = EventKind::Push)]
        event: EventKind,
    },

    /// Evaluate a trigger event and run the pipeline locally
    Run {
        /// Path to pipeline file (searched for when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Event kind
        #[arg(long, value_enum, default_value_t = EventKind::Push)]
        event: EventKind,

        /// Pushed branch
        #[arg(short, long)]
        branch: Option<String>,

        /// Pull request action
        #[arg(long)]
        action: Option<String>,

        /// Pull request target branch
        #[arg(long)]
        target_branch: Option<String>,

        /// Read the event from a JSON file instead of flags
        #[arg(long, conflicts_with_all = ["branch", "action", "target_branch"])]
        event_file: Option<PathBuf>,

        /// Maximum concurrently running jobs
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Abort the run after this many minutes
        #[arg(long)]
        timeout_minutes: Option<u32>,

        /// Treat `uses:` steps as successful no-ops
        #[arg(long)]
        skip_actions: bool,

        /// Directory steps run in (defaults to the current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Print the JSON schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show configuration
    Show,

    /// Set configuration value
    Set {
        /// Configuration key
        key: String,

        /// Configuration value
        value: String,
    },
}
