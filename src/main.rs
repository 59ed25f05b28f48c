mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use fetchlane::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match cli.config.clone() {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Get(args) => app::get(&config, args).await?,
        Commands::Resume(args) => app::resume(&config, args).await?,
        Commands::List(args) => app::list(&config, args)?,
    }

    Ok(())
}
