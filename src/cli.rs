use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tapecache")]
#[command(about = "Inspect and maintain durable ring-buffer record caches", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file. Default: ./tapecache.json when present.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    pub(crate) log_level: String,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub(crate) json: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Show the header and size of a single .tape file.
    Inspect { file: PathBuf },

    /// Print the oldest records of a topic, oldest generation first.
    Dump {
        topic: String,
        /// Cache directory. Default: base_dir from the configuration file.
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Record counts and sizes of every cache generation under a directory.
    Stats {
        #[arg(long)]
        base: Option<PathBuf>,
    },

    /// Remove the oldest records of a topic, oldest generation first.
    Drain {
        topic: String,
        #[arg(long)]
        base: Option<PathBuf>,
        /// Number of records to remove. Default: all of them.
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Remove every record from a .tape file and shrink it to its minimum size.
    Clear { file: PathBuf },

    /// Print the effective configuration.
    Config,
}
