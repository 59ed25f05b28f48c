//! Download tracking: records, the state machine that owns them, and the
//! events it emits.

mod error;
mod events;
mod manager;
mod progress;
mod record;
#[allow(clippy::module_inception)]
mod registry;

pub use error::{DownloadError, Result};
pub use events::{ChannelNotifier, DownloadEvent, EventNotifier};
pub use manager::DownloadManager;
pub use progress::{ProgressReport, ProgressSample, RemainingTime};
pub use record::{DownloadInfo, DownloadRecord, RequestStatus};
pub use registry::{DownloadRegistry, RegistrySettings};
