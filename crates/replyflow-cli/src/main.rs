mod cli;
mod commands;
mod completions;
mod error;
mod output;
mod paths;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to a file so stdout carries only the reply.
    let _guard = match init_logging(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: file logging disabled: {}", err);
            None
        }
    };

    if let Err(err) = commands::run(cli).await {
        error::handle_error(err);
    }
}

fn init_logging(verbose: bool) -> Result<WorkerGuard> {
    let log_dir = paths::ensure_logs_dir()?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "replyflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_level(true)
        .init();

    Ok(guard)
}
