use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Stable identity of one background transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state reported by the transfer facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Created but never started
    Idle,
    Running,
    Suspended,
    /// Cancel requested, completion callback pending
    Canceling,
    Completed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Canceling | TransferState::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Running => "running",
            TransferState::Suspended => "suspended",
            TransferState::Canceling => "canceling",
            TransferState::Completed => "completed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("cannot {action} transfer {id}: it is {state}")]
    IllegalTransition {
        id: TransferId,
        state: TransferState,
        action: &'static str,
    },
}

/// One facility-level transfer.
///
/// Implementations only perform the side effect; legality of the transition is
/// checked by [`TransferHandle`] before any of these are called.
pub trait Transfer: Send + Sync + fmt::Debug {
    fn id(&self) -> TransferId;

    fn state(&self) -> TransferState;

    /// Idle or suspended -> running
    fn resume(&self);

    fn suspend(&self);

    /// Terminal. The facility later reports a completion carrying a
    /// cancellation error.
    fn cancel(&self);

    fn bytes_received(&self) -> u64;

    fn bytes_expected(&self) -> Option<u64>;

    fn description(&self) -> Option<String>;

    fn set_description(&self, description: &str);
}

/// Shared reference to a transfer; equality is transfer identity.
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<dyn Transfer>,
}

impl TransferHandle {
    pub fn new(inner: Arc<dyn Transfer>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> TransferId {
        self.inner.id()
    }

    pub fn state(&self) -> TransferState {
        self.inner.state()
    }

    /// Start a fresh (or suspended) transfer. Starting a running one is a no-op.
    pub fn start(&self) -> Result<(), HandleError> {
        match self.ensure_live("start")? {
            TransferState::Running => Ok(()),
            _ => {
                self.inner.resume();
                Ok(())
            }
        }
    }

    pub fn suspend(&self) -> Result<(), HandleError> {
        match self.ensure_live("suspend")? {
            TransferState::Suspended => Ok(()),
            _ => {
                self.inner.suspend();
                Ok(())
            }
        }
    }

    pub fn resume(&self) -> Result<(), HandleError> {
        match self.ensure_live("resume")? {
            TransferState::Running => Ok(()),
            _ => {
                self.inner.resume();
                Ok(())
            }
        }
    }

    pub fn cancel(&self) -> Result<(), HandleError> {
        self.ensure_live("cancel")?;
        self.inner.cancel();
        Ok(())
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }

    pub fn bytes_expected(&self) -> Option<u64> {
        self.inner.bytes_expected()
    }

    pub fn description(&self) -> Option<String> {
        self.inner.description()
    }

    pub fn set_description(&self, description: &str) {
        self.inner.set_description(description);
    }

    pub fn is_same(&self, other: &TransferHandle) -> bool {
        self.id() == other.id()
    }

    fn ensure_live(&self, action: &'static str) -> Result<TransferState, HandleError> {
        let state = self.inner.state();
        if state.is_terminal() {
            return Err(HandleError::IllegalTransition {
                id: self.inner.id(),
                state,
                action,
            });
        }
        Ok(state)
    }
}

impl PartialEq for TransferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for TransferHandle {}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
