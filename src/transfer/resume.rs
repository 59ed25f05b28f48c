//! Resume tokens and their validation.
//!
//! A failed transfer may hand back a resume token describing where its
//! partially written file lives. Resuming from a token whose file is gone
//! corrupts the transfer, so tokens are only used after [`ResumeTokenValidator`]
//! has confirmed the file is still on disk.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Tokens shorter than this cannot hold a resume payload
pub const MIN_TOKEN_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("resume token is empty or truncated ({0} bytes)")]
    Undersized(usize),

    #[error("resume token cannot be decoded: {0}")]
    Decode(String),

    #[error("resume token does not name a partial file")]
    NoPartialFile,
}

/// Opaque resume payload returned with a failed transfer
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// Decoded contents of a resume token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub url: String,
    /// Absolute location of the partial file, when the facility recorded one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Partial file name relative to the facility's temp directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_file_name: Option<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_expected: Option<u64>,
}

impl ResumeInfo {
    pub fn encode(&self) -> Result<ResumeToken, ResumeError> {
        serde_json::to_vec(self)
            .map(ResumeToken::new)
            .map_err(|e| ResumeError::Decode(e.to_string()))
    }

    pub fn decode(token: &ResumeToken) -> Result<Self, ResumeError> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(ResumeError::Undersized(token.len()));
        }
        serde_json::from_slice(token.as_bytes()).map_err(|e| ResumeError::Decode(e.to_string()))
    }

    /// Where the partial file lives: the explicit local path, or
    /// `temp_dir + temp_file_name` when that path is absent or empty.
    pub fn partial_path(&self, temp_dir: &Path) -> Result<PathBuf, ResumeError> {
        match self.local_path {
            Some(ref path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => match self.temp_file_name.as_deref() {
                Some(name) if !name.is_empty() => Ok(temp_dir.join(name)),
                _ => Err(ResumeError::NoPartialFile),
            },
        }
    }
}

/// Decides whether a resume token can be trusted
#[derive(Debug, Clone)]
pub struct ResumeTokenValidator {
    temp_dir: PathBuf,
}

impl ResumeTokenValidator {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn partial_path(&self, token: &ResumeToken) -> Result<PathBuf, ResumeError> {
        ResumeInfo::decode(token)?.partial_path(&self.temp_dir)
    }

    /// True iff the token decodes and its partial file exists right now.
    /// Every failure counts as invalid.
    pub fn is_valid(&self, token: Option<&ResumeToken>) -> bool {
        let Some(token) = token else {
            return false;
        };

        match self.partial_path(token) {
            Ok(path) => {
                let exists = path.is_file();
                debug!(path = %path.display(), exists, "Checked resume token partial file");
                exists
            }
            Err(e) => {
                debug!(error = %e, "Rejected resume token");
                false
            }
        }
    }
}
