use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchlane")]
#[command(about = "Resumable background HTTP downloads", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides FETCHLANE_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a URL into the destination directory
    Get(GetArgs),
    /// Continue transfers left behind by an earlier run
    Resume(ResumeArgs),
    /// List persisted transfers
    List(ListArgs),
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    pub url: String,

    /// File name to save as (defaults to the last URL path segment)
    #[arg(long)]
    pub name: Option<String>,

    /// How many times a failed download is retried
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(clap::Args, Debug)]
pub struct ResumeArgs {
    /// How many times a failed download is retried
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
