//! Events the registry emits on every transition.

use tokio::sync::mpsc;
use tracing::debug;

use super::error::DownloadError;
use super::record::DownloadInfo;

/// A registry transition. Indexes are positions in the registry at emission
/// time and go stale on the next removal.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Started {
        download: DownloadInfo,
        index: usize,
    },
    Paused {
        download: DownloadInfo,
        index: usize,
    },
    Resumed {
        download: DownloadInfo,
        index: usize,
    },
    Retried {
        download: DownloadInfo,
        index: usize,
    },
    Cancelled {
        download: DownloadInfo,
        index: usize,
    },
    Finished {
        download: DownloadInfo,
        index: usize,
    },
    Failed {
        download: DownloadInfo,
        index: usize,
        error: DownloadError,
    },
    ProgressUpdated {
        download: DownloadInfo,
        index: usize,
    },
    /// Bulk refresh after startup reconciliation or lost-record recovery
    InterruptedTasksPopulated { downloads: Vec<DownloadInfo> },
}

impl DownloadEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::Resumed { .. } => "resumed",
            DownloadEvent::Retried { .. } => "retried",
            DownloadEvent::Cancelled { .. } => "cancelled",
            DownloadEvent::Finished { .. } => "finished",
            DownloadEvent::Failed { .. } => "failed",
            DownloadEvent::ProgressUpdated { .. } => "progress_updated",
            DownloadEvent::InterruptedTasksPopulated { .. } => "interrupted_tasks_populated",
        }
    }

    /// The affected download and its index, for single-download events
    pub fn download(&self) -> Option<(&DownloadInfo, usize)> {
        match self {
            DownloadEvent::Started { download, index }
            | DownloadEvent::Paused { download, index }
            | DownloadEvent::Resumed { download, index }
            | DownloadEvent::Retried { download, index }
            | DownloadEvent::Cancelled { download, index }
            | DownloadEvent::Finished { download, index }
            | DownloadEvent::Failed {
                download, index, ..
            }
            | DownloadEvent::ProgressUpdated { download, index } => Some((download, *index)),
            DownloadEvent::InterruptedTasksPopulated { .. } => None,
        }
    }
}

/// Sink for registry events. Called from the registry's mutation context, so
/// implementations must not block.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: DownloadEvent);
}

/// Forwards events to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventNotifier for ChannelNotifier {
    fn notify(&self, event: DownloadEvent) {
        if self.tx.send(event).is_err() {
            debug!("Download event receiver dropped");
        }
    }
}
