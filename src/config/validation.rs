use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("http.user_agent must not be empty")]
    EmptyUserAgent,

    #[error("downloads.reconcile_timeout_ms must be positive")]
    ZeroReconcileTimeout,

    #[error("downloads.command_buffer must be positive")]
    ZeroCommandBuffer,

    #[error("session.temp_dir and downloads.destination_dir must differ ({path})")]
    TempDirIsDestination { path: String },

    #[error("http.proxy is not a valid URL '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_downloads(config)?;
    validate_http(config)?;
    Ok(())
}

fn validate_downloads(config: &Config) -> Result<(), ValidationError> {
    if config.downloads.reconcile_timeout_ms == 0 {
        return Err(ValidationError::ZeroReconcileTimeout);
    }

    if config.downloads.command_buffer == 0 {
        return Err(ValidationError::ZeroCommandBuffer);
    }

    // Finished files would otherwise be moved onto partial files of other transfers
    if config.session.temp_dir == config.downloads.destination_dir {
        return Err(ValidationError::TempDirIsDestination {
            path: config.session.temp_dir.display().to_string(),
        });
    }

    Ok(())
}

fn validate_http(config: &Config) -> Result<(), ValidationError> {
    if config.http.user_agent.trim().is_empty() {
        return Err(ValidationError::EmptyUserAgent);
    }

    if let Some(ref proxy) = config.http.proxy {
        reqwest::Url::parse(proxy).map_err(|e| ValidationError::InvalidProxy {
            proxy: proxy.clone(),
            reason: e.to_string(),
        })?;
    }

    Ok(())
}
