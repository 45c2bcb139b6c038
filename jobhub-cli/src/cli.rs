//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a job to a hub and wait for its outcome
    Run {
        /// Name of the job to run
        job: String,

        /// JSON parameters for the job (example: --params='{"ms":500}')
        #[arg(long, value_name = "JSON")]
        params: Option<String>,

        /// Run workers inside this process instead of spawning them
        #[arg(long)]
        local: bool,
    },

    /// List the built-in jobs
    Jobs,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },

    /// Run as worker process (internal use)
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Print a sample configuration file
    Generate {
        /// Write the sample here instead of stdout
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}
