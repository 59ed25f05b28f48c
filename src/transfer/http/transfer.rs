use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::store::PersistedTransfer;
use super::{Shared, runner};
use crate::transfer::facility::{TransferError, TransferEvent};
use crate::transfer::handle::{Transfer, TransferHandle, TransferId, TransferState};
use crate::transfer::resume::{ResumeInfo, ResumeToken};

/// One HTTP download owned by an [`super::HttpFacility`]
#[derive(Debug)]
pub struct HttpTransfer {
    id: TransferId,
    url: String,
    partial_path: PathBuf,
    created_at: DateTime<Utc>,
    state: watch::Sender<TransferState>,
    received: AtomicU64,
    expected: Mutex<Option<u64>>,
    description: Mutex<Option<String>>,
    /// Held by the runner fetching into `partial_path`
    pub(super) run_lock: tokio::sync::Mutex<()>,
    shared: Weak<Shared>,
}

impl HttpTransfer {
    pub(super) fn new(
        id: TransferId,
        url: String,
        partial_path: PathBuf,
        shared: Weak<Shared>,
    ) -> Self {
        let received = partial_len(&partial_path);
        Self {
            id,
            url,
            partial_path,
            created_at: Utc::now(),
            state: watch::Sender::new(TransferState::Idle),
            received: AtomicU64::new(received),
            expected: Mutex::new(None),
            description: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            shared,
        }
    }

    pub(super) fn restore(entry: &PersistedTransfer, shared: Weak<Shared>) -> Self {
        let transfer = Self {
            created_at: entry.created_at,
            ..Self::new(entry.id, entry.url.clone(), entry.partial_path.clone(), shared)
        };
        transfer.set_state(entry.state);
        transfer.set_expected(entry.bytes_expected);
        if let Some(ref description) = entry.description {
            transfer.store_description(description);
        }
        transfer
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub(super) fn set_state(&self, state: TransferState) {
        self.state.send_replace(state);
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub(super) fn set_received(&self, bytes: u64) {
        self.received.store(bytes, Ordering::SeqCst);
    }

    /// Returns the new total
    pub(super) fn add_received(&self, bytes: u64) -> u64 {
        self.received.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub(super) fn set_expected(&self, expected: Option<u64>) {
        if let Ok(mut slot) = self.expected.lock() {
            *slot = expected;
        }
    }

    fn store_description(&self, description: &str) {
        if let Ok(mut slot) = self.description.lock() {
            *slot = Some(description.to_string());
        }
    }

    pub(super) fn to_persisted(&self) -> PersistedTransfer {
        PersistedTransfer {
            id: self.id,
            url: self.url.clone(),
            partial_path: self.partial_path.clone(),
            description: self.description(),
            state: self.state(),
            bytes_expected: self.bytes_expected(),
            created_at: self.created_at,
        }
    }

    /// Token for continuing from the partial file, if anything was written
    pub(super) fn resume_token(&self) -> Option<ResumeToken> {
        let received = partial_len(&self.partial_path);
        if received == 0 {
            return None;
        }

        let info = ResumeInfo {
            url: self.url.clone(),
            local_path: Some(self.partial_path.clone()),
            temp_file_name: self
                .partial_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            bytes_received: received,
            bytes_expected: self.bytes_expected(),
        };

        match info.encode() {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(transfer_id = %self.id, error = %e, "Could not encode resume token");
                None
            }
        }
    }

    /// Drop the partial file and report the cancellation
    pub(super) fn finish_cancelled(self: &Arc<Self>, shared: &Shared) {
        if self.state() == TransferState::Completed {
            return;
        }
        self.set_state(TransferState::Completed);
        if let Err(e) = std::fs::remove_file(&self.partial_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(transfer_id = %self.id, error = %e, "Could not remove partial file");
            }
        }
        shared.forget(&self.id);
        shared.emit(TransferEvent::Completed {
            handle: TransferHandle::new(self.clone()),
            error: Some(TransferError::cancelled()),
        });
        debug!(transfer_id = %self.id, "Transfer cancelled");
    }
}

impl Transfer for HttpTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    fn resume(&self) {
        let Some(shared) = self.shared.upgrade() else {
            warn!(transfer_id = %self.id, "Facility is gone; cannot resume transfer");
            return;
        };

        if !matches!(self.state(), TransferState::Idle | TransferState::Suspended) {
            return;
        }

        self.set_state(TransferState::Running);
        shared.persist(self);

        match shared.lookup(&self.id) {
            Some(this) => runner::spawn(&shared, this),
            None => warn!(transfer_id = %self.id, "Resumed transfer is not registered"),
        }
    }

    fn suspend(&self) {
        if !matches!(self.state(), TransferState::Idle | TransferState::Running) {
            return;
        }
        self.set_state(TransferState::Suspended);
        if let Some(shared) = self.shared.upgrade() {
            shared.persist(self);
        }
    }

    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(TransferState::Canceling);

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(this) = shared.lookup(&self.id) else {
            return;
        };

        // Whoever holds the partial file finishes the cancel
        match self.run_lock.try_lock() {
            Ok(_guard) => {
                this.finish_cancelled(&shared);
                shared.flush_if_idle();
            }
            Err(_) => {
                tokio::spawn(async move {
                    let _guard = this.run_lock.lock().await;
                    if this.state() == TransferState::Canceling {
                        this.finish_cancelled(&shared);
                        shared.flush_if_idle();
                    }
                });
            }
        }
    }

    fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn bytes_expected(&self) -> Option<u64> {
        self.expected.lock().ok().and_then(|slot| *slot)
    }

    fn description(&self) -> Option<String> {
        self.description.lock().ok().and_then(|slot| slot.clone())
    }

    fn set_description(&self, description: &str) {
        self.store_description(description);
        if let Some(shared) = self.shared.upgrade() {
            shared.persist(self);
        }
    }
}

fn partial_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
