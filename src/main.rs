use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use opqueue::cli::args::{Cli, Commands, DlqCommands};
use opqueue::cli::commands::{self, Context};
use opqueue::config::{Config, Paths};
use opqueue::telemetry::init_logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}: {e:#}", "error".red().bold());
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.output;

    let paths = Paths::default().with_overrides(cli.config, cli.db);
    let config = Config::load_from_path(&paths.config_file)?;
    init_logging(&config.logging)?;
    let ctx = Context::open(paths, config)?;

    let output = match cli.command {
        Commands::Status => commands::status(&ctx, format)?,
        Commands::Enqueue(args) => commands::enqueue(&ctx, args, format).await?,
        Commands::List(args) => commands::list(&ctx, &args, format)?,
        Commands::Run(args) => commands::run(&ctx, &args, format).await?,
        Commands::Dlq(args) => match args.command {
            DlqCommands::List => commands::dlq_list(&ctx, format)?,
            DlqCommands::Retry { id } => commands::dlq_retry(&ctx, &id, format).await?,
        },
        Commands::Dequeue { id } => commands::dequeue(&ctx, &id, format).await?,
        Commands::Clear { force } => commands::clear(&ctx, force, format).await?,
        Commands::Purge => commands::purge(&ctx, format)?,
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
