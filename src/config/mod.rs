//! Configuration management for fetchlane
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use fetchlane::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Finished files go to: {}", config.downloads.destination_dir.display());
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `FETCHLANE__<section>__<key>`
//!
//! Examples:
//! - `FETCHLANE__DOWNLOADS__DESTINATION_DIR=/srv/files`
//! - `FETCHLANE__SESSION__RESUME_ON_LAUNCH=false`
//! - `FETCHLANE__HTTP__PROGRESS_INTERVAL=256KB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/fetchlane.toml`.
//! This can be overridden using the `FETCHLANE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{Config, DownloadsConfig, HttpConfig, SessionConfig};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`FETCHLANE__*`)
    /// 2. TOML file (default: `config/fetchlane.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
