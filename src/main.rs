//! Yank - LAN clipboard synchronization service
//!
//! This is the main entry point for the yank CLI and agent.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yank::cli::{exit_code_for, Cli, CliHandler};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("yank={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            exit_code_for(&err)
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> yank::Result<()> {
    let mut handler = CliHandler::new()?;
    handler.handle_command(cli.command).await
}
