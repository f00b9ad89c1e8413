use std::io::Write;

use clap::Parser;
use vsistore_cli::{Cli, Context};
use vsistore_storage::{registry, Config};
use vsistore_tracing::TracingBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let tracing_handle = TracingBuilder::default()
        .level(cli.log_level)
        .json(cli.json)
        .enable_progressbar()
        .build()?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let registry = registry::init_once(&config.handlers)?;

    let ctx = Context {
        registry,
        config,
        catalog_path: cli.catalog,
    };

    let mut stdout = tracing_handle.get_stdout_writer();
    if let Err(e) = vsistore_cli::run(&ctx, cli.command, &mut stdout).await {
        writeln!(tracing_handle.get_stderr_writer(), "error: {}", e)?;
        std::process::exit(1);
    }

    Ok(())
}
