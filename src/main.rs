mod backend;
mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod runner;
mod ui;
mod workspace;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet { log::LevelFilter::Error } else { log_level })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Validate(args) => commands::validate::run(&ctx, &args),
        Command::Plan(args) => {
            let config = config::GraderConfig::load(config_path)?;
            commands::plan::run(&ctx, &config, &args)
        }
        Command::Grade(args) => {
            let config = config::GraderConfig::load(config_path)?;
            commands::grade::run(&ctx, config, &args)
        }
        Command::Doctor => commands::doctor::run(&ctx, config_path),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "hammer", &mut io::stdout());
            Ok(())
        }
    }
}
