mod config;
mod error;
mod http;

use clap::Parser;
use config::{Cli, Commands};

mod cmd;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => cmd::serve::run(args).await,
        Commands::Probe(args) => cmd::probe::run(args).await,
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "courier-worker failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
