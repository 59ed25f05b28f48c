use std::sync::Arc;
use thiserror::Error;

use crate::transfer::{DescriptionError, FacilityError, HandleError, TransferError};

/// Errors surfaced by the download registry, either as return values of its
/// operations or inside `Failed` events.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("Invalid download request: {0}")]
    InvalidRequest(String),

    #[error("No download at index {index} ({len} tracked)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Transfer facility error: {0}")]
    Facility(#[from] FacilityError),

    #[error("Transfer handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("Transfer description error: {0}")]
    Description(#[from] DescriptionError),

    #[error("Failed to move '{file_name}' to its destination: {source}")]
    Move {
        file_name: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Unknown error occurred")]
    Unknown,

    #[error("Download manager is no longer running")]
    ManagerClosed,
}

pub type Result<T> = std::result::Result<T, DownloadError>;
