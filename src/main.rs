mod cli;
mod commands;
mod config_file;
mod logging;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config_file::load_store_config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level)?;
    let config = load_store_config(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Command::Inspect { file } => commands::inspect(&file, json),
        Command::Dump { topic, base, limit } => {
            let base = config.base_dir(base)?;
            commands::dump(&base, &topic, limit, json)
        }
        Command::Stats { base } => commands::stats(&config.base_dir(base)?, json),
        Command::Drain { topic, base, count } => {
            commands::drain(&config.base_dir(base)?, &topic, count, json)
        }
        Command::Clear { file } => commands::clear(&file, json),
        Command::Config => commands::show_config(&config),
    }
}
