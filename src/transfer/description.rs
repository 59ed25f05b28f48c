//! Opaque transfer description codec.
//!
//! The description is the only thing the transfer facility keeps about what a
//! transfer was for, so it must be attached before the transfer starts. It is
//! a self-delimiting JSON object that fits the facility's string slot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptionError {
    #[error("transfer has no description")]
    Missing,

    #[error("malformed transfer description: {0}")]
    Malformed(String),

    #[error("transfer description has an empty '{0}' field")]
    EmptyField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub url: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

impl TaskDescription {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
        }
    }

    pub fn encode(&self) -> Result<String, DescriptionError> {
        serde_json::to_string(self).map_err(|e| DescriptionError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, DescriptionError> {
        let description: Self =
            serde_json::from_str(raw).map_err(|e| DescriptionError::Malformed(e.to_string()))?;

        if description.url.trim().is_empty() {
            return Err(DescriptionError::EmptyField("url"));
        }
        if description.file_name.trim().is_empty() {
            return Err(DescriptionError::EmptyField("fileName"));
        }

        Ok(description)
    }

    /// Decode the description attached to a transfer, if any
    pub fn from_slot(slot: Option<&str>) -> Result<Self, DescriptionError> {
        match slot {
            Some(raw) if !raw.is_empty() => Self::decode(raw),
            _ => Err(DescriptionError::Missing),
        }
    }
}
