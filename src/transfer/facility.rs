use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::handle::TransferHandle;
use super::resume::ResumeToken;

/// Why the facility tore down a whole session rather than one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    UserForceQuit,
    BackgroundUpdatesDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// The transfer was cancelled through its handle
    Cancelled,
    SessionInterrupted(InterruptReason),
    Network,
    Http(u16),
    Io,
    Unknown,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferErrorKind::Cancelled => f.write_str("cancelled"),
            TransferErrorKind::SessionInterrupted(reason) => {
                write!(f, "session interrupted ({:?})", reason)
            }
            TransferErrorKind::Network => f.write_str("network error"),
            TransferErrorKind::Http(status) => write!(f, "HTTP {}", status),
            TransferErrorKind::Io => f.write_str("I/O error"),
            TransferErrorKind::Unknown => f.write_str("unknown error"),
        }
    }
}

/// Error reported by the facility when a transfer completes unsuccessfully
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    /// Present when enough was written to continue without refetching
    pub resume_token: Option<ResumeToken>,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resume_token: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransferErrorKind::Cancelled, "transfer cancelled")
    }

    pub fn interrupted(reason: InterruptReason) -> Self {
        Self::new(
            TransferErrorKind::SessionInterrupted(reason),
            "background session was interrupted",
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Network, message)
    }

    pub fn http(status: u16, reason: Option<&str>) -> Self {
        Self::new(TransferErrorKind::Http(status), reason.unwrap_or("Unknown"))
    }

    pub fn io(error: std::io::Error) -> Self {
        Self::new(TransferErrorKind::Io, error.to_string())
    }

    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == TransferErrorKind::Cancelled
    }

    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        match self.kind {
            TransferErrorKind::SessionInterrupted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TransferError::http(status.as_u16(), status.canonical_reason()),
            None => TransferError::network(error.to_string()),
        }
    }
}

/// Errors creating transfers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FacilityError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("resume token rejected: {0}")]
    InvalidResumeToken(String),

    #[error("transfer state persistence failed: {0}")]
    Persistence(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FacilityError {
    fn from(error: std::io::Error) -> Self {
        FacilityError::Io(error.to_string())
    }
}

/// Callbacks the facility delivers for its transfers
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress {
        handle: TransferHandle,
        bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// The payload is complete at `location`; it must be moved away before
    /// the transfer's completion is handled.
    FinishedToLocation {
        handle: TransferHandle,
        location: PathBuf,
    },
    Completed {
        handle: TransferHandle,
        error: Option<TransferError>,
    },
    /// No transfer of the session is running any more
    AllEventsFlushed,
}

/// Background transfer capability the registry depends on
#[async_trait]
pub trait TransferFacility: Send + Sync {
    /// Idle transfer fetching `url` from the start
    fn create_transfer(&self, url: &str) -> Result<TransferHandle, FacilityError>;

    /// Idle transfer continuing from a resume token's partial file
    fn create_transfer_with_resume_token(
        &self,
        token: &ResumeToken,
    ) -> Result<TransferHandle, FacilityError>;

    /// Every transfer the facility still knows about, including ones created
    /// by a previous process.
    async fn persisted_transfers(&self) -> Vec<TransferHandle>;

    /// Stop delivering work and flush persisted state
    async fn shutdown(&self);
}
