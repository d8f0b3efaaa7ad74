mod audit;
mod cli;
mod commands;
mod config;
mod entry;
mod graph;
mod paths;
mod pipeline;
mod plugins;
mod tf;
mod ui;

use std::io;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands};
use dagflow::Operation;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context { quiet: cli.quiet };

    match cli.command {
        Commands::Plan(args) => commands::run::run(&ctx, Operation::Plan, args),
        Commands::Apply(args) => commands::run::run(&ctx, Operation::Apply, args),
        Commands::Destroy(args) => commands::run::run(&ctx, Operation::Destroy, args),
        Commands::Pipeline(args) => commands::pipeline::run(&ctx, args),
        Commands::Graph { directory } => commands::graph::run(&directory),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tfwrap", &mut io::stdout());
            Ok(())
        }
    }
}
