use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "research-pilot")]
#[command(author, version, about = "Phase-gated coordinator for research sessions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config.toml (defaults apply when the file is absent)
    #[arg(long, global = true, env = "RESEARCH_PILOT_CONFIG")]
    #[arg(default_value = "research-pilot.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Walk a scripted session from Initiation to Closed, printing both push channels
    Demo {
        /// Opening draft of the research question
        #[arg(long, default_value = "How do rivers recover after dam removal?")]
        question: String,
    },

    /// Validate a role table and list the task types it declares
    Roles {
        /// Role table path (default: the configured roles_path, else the builtin table)
        path: Option<PathBuf>,
    },
}
