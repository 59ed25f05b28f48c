use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Registry-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadsConfig {
    /// Finished files are moved to `<destination_dir>/<file_name>`
    #[serde(default = "default_destination_dir")]
    pub destination_dir: PathBuf,
    /// Upper bound on the startup enumeration of persisted transfers
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,
    /// Capacity of the registry actor's command channel
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl DownloadsConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            destination_dir: default_destination_dir(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            command_buffer: default_command_buffer(),
        }
    }
}

fn default_destination_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_reconcile_timeout_ms() -> u64 {
    5_000
}

fn default_command_buffer() -> usize {
    64
}

/// Background transfer session settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Fjall keyspace holding persisted transfer state
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Directory for partially written files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Restart transfers that were running when the previous process exited.
    /// When false they are reported as interrupted instead.
    #[serde(default = "default_resume_on_launch")]
    pub resume_on_launch: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            temp_dir: default_temp_dir(),
            resume_on_launch: default_resume_on_launch(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/session")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("data/partial")
}

fn default_resume_on_launch() -> bool {
    true
}

/// HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout; unset by default since large files take long
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Minimum number of bytes between two progress callbacks
    #[serde(default = "default_progress_interval")]
    pub progress_interval: ByteSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: None,
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            progress_interval: default_progress_interval(),
            proxy: None,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("fetchlane/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_redirects() -> usize {
    10
}

fn default_progress_interval() -> ByteSize {
    ByteSize(64 * 1024)
}
