use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

use super::error::DownloadError;
use crate::transfer::{ResumeToken, TransferHandle, TransferId};

/// Where a tracked download stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Unknown,
    GettingInfo,
    Downloading,
    Paused,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Unknown => "unknown",
            RequestStatus::GettingInfo => "getting_info",
            RequestStatus::Downloading => "downloading",
            RequestStatus::Paused => "paused",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical download, owned by the registry while it is tracked.
///
/// Identity is the handle's transfer identity, never the URL.
#[derive(Debug)]
pub struct DownloadRecord {
    pub url: String,
    pub file_name: String,
    pub status: RequestStatus,
    /// Throughput reference point; reset on (re)start and pause
    pub start_time: Instant,
    pub created_at: DateTime<Utc>,
    /// `None` while the total size is unknown
    pub progress: Option<f64>,
    pub detail_text: String,
    /// Absent only when a replacement transfer could not be built
    pub handle: Option<TransferHandle>,
    pub resume_token: Option<ResumeToken>,
    /// Set when the finished payload could not be moved into place
    pub pending_move_error: Option<DownloadError>,
}

impl DownloadRecord {
    pub fn new(
        url: impl Into<String>,
        file_name: impl Into<String>,
        status: RequestStatus,
        handle: Option<TransferHandle>,
    ) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            status,
            start_time: Instant::now(),
            created_at: Utc::now(),
            progress: None,
            detail_text: String::new(),
            handle,
            resume_token: None,
            pending_move_error: None,
        }
    }

    pub fn transfer_id(&self) -> Option<TransferId> {
        self.handle.as_ref().map(TransferHandle::id)
    }

    pub fn is_tracking(&self, handle: &TransferHandle) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|own| own.is_same(handle))
    }

    pub fn info(&self) -> DownloadInfo {
        DownloadInfo {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            status: self.status,
            progress: self.progress,
            detail_text: self.detail_text.clone(),
            transfer_id: self.transfer_id(),
            created_at: self.created_at,
        }
    }
}

/// Read-only snapshot of a record handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadInfo {
    pub url: String,
    pub file_name: String,
    pub status: RequestStatus,
    pub progress: Option<f64>,
    pub detail_text: String,
    pub transfer_id: Option<TransferId>,
    pub created_at: DateTime<Utc>,
}
