mod agents;
mod cli;
mod error;
mod logging;
mod utils;
mod workflow;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use std::process;
use workflow::RunOptions;

fn main() {
    let cli = Cli::parse();

    logging::init_logging(cli.log_level, cli.verbose);

    let options = RunOptions {
        docker: cli.docker.clone(),
        show_progress: cli.show_progress(),
    };

    let result = match cli.command {
        Commands::Update {
            image,
            tag,
            dry_run,
        } => workflow::execute_update(&cli.file, &image, tag, dry_run, &options),
        Commands::Plan { image, tag, json } => workflow::execute_plan(&cli.file, &image, tag, json),
        Commands::List => workflow::execute_list(&cli.file),
        Commands::Check => workflow::execute_check(&cli.file),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if e.is_config_error() {
            eprintln!("{}", "No image was built.".dimmed());
        }
        process::exit(1);
    }
}
