//! CLI parse: clap types for genforge. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// genforge CLI - queued content generation jobs
#[derive(Parser)]
#[command(name = "genforge")]
#[command(about = "Run and inspect queued content generation jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (where config/ is looked up)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a job and wait for it to settle
    Submit {
        /// Job kind (article, quiz, flashcards, recipe, story)
        kind: String,
        /// Prompt text
        prompt: String,
        /// Owner the job is queued under
        #[arg(long, default_value = "cli")]
        owner: String,
        /// Extra form field as key=value (value parsed as JSON when possible)
        #[arg(long = "form", value_name = "KEY=VALUE")]
        form: Vec<String>,
        /// Skip the illustration stage
        #[arg(long)]
        no_asset: bool,
        /// Seconds to wait for the job to settle
        #[arg(long, default_value = "180")]
        timeout: u64,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Inspect and manage stored jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Show queue settings and job counts
    Queue {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Run the extraction ladder over a file of model output
    Extract {
        /// File holding raw model output
        file: PathBuf,
        /// Validate against this kind's schema
        #[arg(long)]
        kind: Option<String>,
        /// Treat the output as cut off by a length limit
        #[arg(long)]
        truncated: bool,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List jobs
    List {
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show one job
    Show {
        /// Job id
        id: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Resubmit a settled job and wait for the new one
    Retry {
        /// Job id
        id: String,
        /// Seconds to wait for the new job to settle
        #[arg(long, default_value = "180")]
        timeout: u64,
    },
    /// Remove a job
    Cancel {
        /// Job id
        id: String,
    },
    /// Fail stale active jobs and drop expired settled jobs
    Cleanup {
        /// Override the stale threshold (seconds)
        #[arg(long)]
        stale_after: Option<u64>,
        /// Override settled retention (seconds)
        #[arg(long)]
        retention: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Output format (toml or json)
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Validate the effective configuration
    Validate,
}
